//! # Reconnect Supervisor
//!
//! One task per connector that owns recovery. It parks on the active
//! channel's loss notification; when that fires it drops the dead channel,
//! then retries on a fixed interval until a connect succeeds. The successful
//! attempt has already replayed every registration (see
//! `ConnectorInner::open`), so the supervisor only has to swap in the new
//! channel and go back to watching.
//!
//! Retries never back off and never give up. A broker that rejects every
//! attempt (bad credentials, say) keeps the connector in `Recovering` and
//! shows up only in the logs and the error counters.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::connector::ConnectorInner;

/// Lifecycle of a bus connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    /// Not connected and not trying to be.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Channel open, subscriptions bound.
    Connected,
    /// The connection was lost; waiting for the next retry tick.
    Recovering,
    /// `close` was called. Final.
    Closed,
}

/// Watches `lost` and reconnects until the connector shuts down.
pub(crate) async fn supervise(inner: Arc<ConnectorInner>, mut lost: CancellationToken) {
    let retry = inner.options.retry_interval;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = lost.cancelled() => {}
        }
        log::warn!("Bus connection closed, recovering every {:?}", retry);
        inner.set_state(ConnectorState::Recovering);
        inner.clear_channel();

        let mut ticker = interval_at(Instant::now() + retry, retry);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        lost = loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            log::info!("Trying to recover the bus connection");
            inner.set_state(ConnectorState::Connecting);
            match inner.open().await {
                Ok(channel) => {
                    inner.set_state(ConnectorState::Connected);
                    break channel.closed();
                }
                Err(e) => {
                    log::error!("Cannot connect to the bus: {}", e);
                    inner.set_state(ConnectorState::Recovering);
                }
            }
        };
    }
}
