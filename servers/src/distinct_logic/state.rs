use lib_counter::{BusConnector, CounterSink, RollupEngine};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RollupEngine>,
    pub connector: BusConnector,
    pub metrics: Arc<CounterSink>,
    // Key of the most recent successful rollup
    latest_summary: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(engine: Arc<RollupEngine>, connector: BusConnector, metrics: Arc<CounterSink>) -> Self {
        Self {
            engine,
            connector,
            metrics,
            latest_summary: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_latest_summary(&self, key: String) {
        let mut guard = self.latest_summary.write().await;
        *guard = Some(key);
    }

    pub async fn latest_summary(&self) -> Option<String> {
        self.latest_summary.read().await.clone()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use lib_counter::connections::{MemoryBroker, MemoryBucketStore};
    use lib_counter::{ConnectorOptions, RollupOptions};

    /// State over in-memory collaborators. The connector is not connected.
    pub(crate) fn memory_state() -> (MemoryBroker, Arc<MemoryBucketStore>, AppState) {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryBucketStore::new());
        let metrics = Arc::new(CounterSink::new());
        let engine = Arc::new(RollupEngine::new(store.clone(), RollupOptions::default()));
        let connector = BusConnector::new(Arc::new(broker.clone()), ConnectorOptions::default(), metrics.clone());
        (broker, store, AppState::new(engine, connector, metrics))
    }
}
