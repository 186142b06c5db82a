use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    Ok(())
}

impl Engine {
    /// Add a venue (`Exclusive`) or a catalog item (`Pooled`).
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let _tx = self.begin().await;
        // Publish the row write-locked so racing creates see the id taken and
        // bookings wait until it is durable.
        let row = Arc::new(RwLock::new(ResourceState::new(id, name.clone(), kind)));
        let pending = row.clone().write_owned().await;
        match self.resources.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
            }
        }

        let event = Event::ResourceCreated { id, name, kind };
        if let Err(e) = self.wal_commit(std::slice::from_ref(&event)).await {
            self.resources
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &row));
            return Err(e);
        }
        drop(pending);
        self.notify.send(&event);
        info!("created {} resource {id}", kind.as_str());
        Ok(())
    }

    /// Rename a resource and, for pooled items, change the stock on hand.
    ///
    /// Lowering stock below what is currently out on loan is allowed; existing
    /// loans stay approved and later checks see a negative availability.
    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        total_stock: Option<u32>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _tx = self.begin().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let kind = match (guard.kind, total_stock) {
            (ResourceKind::Exclusive, Some(_)) => {
                return Err(EngineError::InvariantViolation(
                    "exclusive resources have no stock",
                ));
            }
            (_, Some(total_stock)) => ResourceKind::Pooled { total_stock },
            (kind, None) => kind,
        };

        let event = Event::ResourceUpdated {
            id,
            name: name.clone(),
            kind,
        };
        self.wal_commit(std::slice::from_ref(&event)).await?;
        guard.name = name;
        guard.kind = kind;
        self.notify.send(&event);
        Ok(())
    }

    /// Insert or rename a participant in the roster's identity read model.
    pub async fn register_participant(
        &self,
        id: Ulid,
        display_name: String,
    ) -> Result<(), EngineError> {
        if display_name.trim().is_empty() {
            return Err(EngineError::InvariantViolation("display name is empty"));
        }
        if display_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("display name too long"));
        }
        if !self.participants.contains_key(&id) && self.participants.len() >= MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        let _tx = self.begin().await;

        let event = Event::ParticipantRegistered {
            id,
            display_name: display_name.clone(),
        };
        self.wal_commit(std::slice::from_ref(&event)).await?;
        self.participants.insert(id, Participant { id, display_name });
        self.notify.send(&event);
        Ok(())
    }
}
