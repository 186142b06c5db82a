use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::config::Config;
use crate::engine::Engine;
use crate::ledger::Ledger;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-lodge engines. Each lodge gets its own Engine + WAL + compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    compact_interval: Duration,
    ledger: Option<Arc<dyn Ledger>>,
}

impl TenantManager {
    pub fn new(config: &Config) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir: config.data_dir.clone(),
            compact_threshold: config.compact_threshold,
            compact_interval: config.compact_interval,
            ledger: None,
        }
    }

    /// Ledger installed on every engine created from now on.
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Get or lazily create the engine for the given lodge.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let mut engine = Engine::new(wal_path, notify)?;
        if let Some(ledger) = &self.ledger {
            engine = engine.with_ledger(ledger.clone());
        }

        // Concurrent first calls race to insert; the loser's engine is dropped
        // before its compactor starts.
        let engine = match self.engines.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => slot.insert(Arc::new(engine)).clone(),
        };

        tokio::spawn(compactor::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.compact_interval,
        ));

        info!("opened lodge {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
