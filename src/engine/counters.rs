use std::time::Instant;

use tracing::debug;

use crate::limits::MAX_COUNTER_NAME_LEN;
use crate::model::Event;
use crate::observability::{record_op, COUNTER_ISSUED_TOTAL};

use super::{Engine, EngineError, SharedCounter};

fn validate_counter_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvariantViolation("counter name is empty"));
    }
    if name.len() > MAX_COUNTER_NAME_LEN {
        return Err(EngineError::InvariantViolation("counter name too long"));
    }
    Ok(())
}

impl Engine {
    /// The row for `name`, created empty if absent. An empty row reads as an
    /// absent counter until a value is committed into it.
    fn counter_row(&self, name: &str) -> SharedCounter {
        if let Some(row) = self.counters.get(name) {
            return row.value().clone();
        }
        self.counters.entry(name.to_string()).or_default().clone()
    }

    /// Issue the next number of a named sequence, starting at 1.
    pub async fn counter_next(&self, name: &str) -> Result<u64, EngineError> {
        validate_counter_name(name)?;
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let row = self.counter_row(name);
            let mut value = row.lock().await;
            let next = value
                .unwrap_or(0)
                .checked_add(1)
                .ok_or(EngineError::LimitExceeded("counter overflow"))?;
            let event = Event::CounterSet {
                name: name.to_string(),
                value: next,
            };
            self.wal_commit(std::slice::from_ref(&event)).await?;
            *value = Some(next);
            self.notify.send(&event);
            Ok(next)
        }
        .await;
        if let Ok(value) = result {
            metrics::counter!(COUNTER_ISSUED_TOTAL).increment(1);
            debug!("counter {name} issued {value}");
        }
        record_op("counter_next", started, &result);
        result
    }

    /// Overwrite a sequence's current value, creating it if needed.
    pub async fn counter_set(&self, name: &str, value: u64) -> Result<(), EngineError> {
        validate_counter_name(name)?;
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let row = self.counter_row(name);
            let mut current = row.lock().await;
            let event = Event::CounterSet {
                name: name.to_string(),
                value,
            };
            self.wal_commit(std::slice::from_ref(&event)).await?;
            *current = Some(value);
            self.notify.send(&event);
            Ok(())
        }
        .await;
        record_op("counter_set", started, &result);
        result
    }

    /// Hand back the most recently issued number. Succeeds only if nothing
    /// was issued since `expected`; otherwise the sequence is left alone.
    pub async fn counter_revert(&self, name: &str, expected: u64) -> Result<bool, EngineError> {
        validate_counter_name(name)?;
        let started = Instant::now();
        let result = async {
            if expected == 0 {
                return Ok(false);
            }
            let _tx = self.begin().await;
            let Some(row) = self.counters.get(name).map(|r| r.value().clone()) else {
                return Ok(false);
            };
            let mut current = row.lock().await;
            if *current != Some(expected) {
                debug!("counter {name} revert of {expected} refused at {:?}", *current);
                return Ok(false);
            }
            let event = Event::CounterSet {
                name: name.to_string(),
                value: expected - 1,
            };
            self.wal_commit(std::slice::from_ref(&event)).await?;
            *current = Some(expected - 1);
            self.notify.send(&event);
            Ok(true)
        }
        .await;
        record_op("counter_revert", started, &result);
        result
    }

    pub async fn counter_current(&self, name: &str) -> Option<u64> {
        let row = self.counters.get(name).map(|r| r.value().clone())?;
        let value = *row.lock().await;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use metrics_exporter_prometheus::PrometheusBuilder;

    use crate::notify::NotifyHub;

    #[test]
    fn counter_names_are_checked() {
        assert!(validate_counter_name("").is_err());
        assert!(validate_counter_name(&"n".repeat(MAX_COUNTER_NAME_LEN + 1)).is_err());
        assert!(validate_counter_name("invoice").is_ok());
    }

    #[test]
    fn every_counter_op_is_recorded() {
        let path = std::env::temp_dir()
            .join(format!("lodgebook_counter_ops_{}.wal", ulid::Ulid::new()));
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
                engine.counter_set("ballot", 4).await.unwrap();
                engine.counter_next("ballot").await.unwrap();
                assert!(engine.counter_revert("ballot", 5).await.unwrap());
                assert!(!engine.counter_revert("ballot", 5).await.unwrap());
            });
        });

        let rendered = handle.render();
        for op in ["counter_set", "counter_next", "counter_revert"] {
            assert!(rendered.contains(&format!(r#"op="{op}""#)), "{op} missing:\n{rendered}");
        }
    }
}
