use std::sync::Arc;

use lib_counter::{Disposition, MessageHandler, MetricEntry, RollupEngine};

/// Processing function registered for every configured subscription:
/// decode the payload, count it, acknowledge. Any failure requeues.
pub fn ingest_handler(subscription: String, engine: Arc<RollupEngine>) -> impl MessageHandler {
    let subscription = Arc::new(subscription);
    move |payload: Vec<u8>| {
        let engine = engine.clone();
        let subscription = subscription.clone();
        async move {
            let entry = match MetricEntry::decode(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("[{}] Undecodable payload, requeueing: {}", subscription, e);
                    return Disposition::Requeue;
                }
            };

            match engine.ingest(&entry).await {
                Ok(score) => {
                    log::debug!("[{}] {} -> {} ({})", subscription, entry.action, score, entry.actor);
                    Disposition::Acknowledge
                }
                Err(e) => {
                    log::error!("[{}] Failed to count '{}': {}", subscription, entry.action, e);
                    Disposition::Requeue
                }
            }
        }
    }
}
