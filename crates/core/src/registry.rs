//! Process-wide `serial -> Source` registry: at most one active Source per
//! device, shared across every client transport that wants it.
//!
//! Same get-or-create shape as the browser/agent channel registry this
//! crate's sibling server uses for signaling sessions, keyed by device
//! serial instead of session id.

use crate::launcher::StreamMode;
use crate::source::Source;
use screenbridge_protocol::{DeviceConfig, StreamConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub type SourceRegistry = Arc<RwLock<HashMap<String, Arc<Source>>>>;

pub fn new_source_registry() -> SourceRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Return the existing Source for `serial` if one is already registered and
/// started; otherwise construct one, start it, and register it.
///
/// Concurrent callers racing on the same serial converge on the same
/// Source: the write-lock window that inserts a freshly constructed Source
/// is the same window every other caller blocks on, so only one ever wins
/// the insert.
pub async fn start_source_with_mode(
    registry: &SourceRegistry,
    serial: &str,
    device_config: DeviceConfig,
    stream_config: StreamConfig,
    mode: StreamMode,
) -> crate::error::Result<Arc<Source>> {
    {
        let sources = registry.read().await;
        if let Some(source) = sources.get(serial) {
            return Ok(Arc::clone(source));
        }
    }

    let mut sources = registry.write().await;
    if let Some(source) = sources.get(serial) {
        return Ok(Arc::clone(source));
    }

    let source = Source::new(serial, device_config, stream_config);
    source.start(mode).await?;
    sources.insert(serial.to_string(), Arc::clone(&source));
    info!(serial, "source registered");
    Ok(source)
}

pub async fn get_source(registry: &SourceRegistry, serial: &str) -> Option<Arc<Source>> {
    registry.read().await.get(serial).cloned()
}

pub async fn remove_source(registry: &SourceRegistry, serial: &str) {
    let source = registry.write().await.remove(serial);
    if let Some(source) = source {
        source.teardown().await;
        debug!(serial, "source removed");
    }
}

pub async fn list_serials(registry: &SourceRegistry) -> Vec<String> {
    registry.read().await.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_source_on_empty_registry_is_a_no_op() {
        let registry = new_source_registry();
        remove_source(&registry, "emulator-5554").await;
        assert!(list_serials(&registry).await.is_empty());
    }

    #[tokio::test]
    async fn get_source_on_empty_registry_returns_none() {
        let registry = new_source_registry();
        assert!(get_source(&registry, "emulator-5554").await.is_none());
    }
}
