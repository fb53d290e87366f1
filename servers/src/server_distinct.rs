use anyhow::{Context, Result};
use lib_counter::connections::{RedisBucketStore, RedisStreamTransport};
use lib_counter::{BusConnector, CounterError, CounterSink, RollupEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod distinct_logic;
use distinct_logic::{config, handler, logger, monitor, scheduler, state};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(config.log_dir(), config.log_level())?;

    let store = RedisBucketStore::new(&config.store_url())
        .await
        .context("Failed to open the bucket store")?;
    let engine = Arc::new(RollupEngine::new(Arc::new(store), config.rollup_options()));

    let transport = RedisStreamTransport::new(&config.bus_url(), config.stream_options())
        .context("Invalid bus connection parameters")?;
    let metrics = Arc::new(CounterSink::new());
    let connector = BusConnector::new(Arc::new(transport), config.connector_options(), metrics.clone());
    let retry_interval = connector.options().retry_interval;

    for name in config.subscription_names() {
        connector
            .register(&name, handler::ingest_handler(name.clone(), engine.clone()))
            .await?;
    }

    let app_state = state::AppState::new(engine, connector.clone(), metrics);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let monitor_handle = tokio::spawn(monitor::run(
        config.monitor_port(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));
    let mut rollup_scheduler = scheduler::start(config.rollup_cron(), app_state.clone()).await?;
    let connect_handle = tokio::spawn(connect_until_up(connector.clone(), retry_interval));

    shutdown_signal().await;

    if let Err(e) = rollup_scheduler.shutdown().await {
        log::error!("Failed to stop the rollup scheduler: {}", e);
    }
    // An attempt in progress finishes first; connect_until_up then sees Closed.
    if let Err(e) = connector.close().await {
        log::error!("Failed to close the bus connector: {}", e);
    }
    if let Err(e) = connect_handle.await {
        log::error!("Bus connect task failed: {}", e);
    }

    // Send shutdown signal to the monitor
    let _ = shutdown_tx.send(());
    match monitor_handle.await {
        Ok(Err(e)) => log::error!("Monitor stopped with error: {}", e),
        Err(e) => log::error!("Monitor task failed: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}

/// The first connect. After it succeeds the connector's supervisor owns recovery.
async fn connect_until_up(connector: BusConnector, retry_interval: Duration) {
    loop {
        match connector.connect().await {
            Ok(()) => return,
            Err(CounterError::Closed) => return,
            Err(e) => {
                log::warn!("Bus not reachable yet ({}), retrying in {:?}", e, retry_interval);
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::error!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_counter::connections::MemoryBroker;
    use lib_counter::{ConnectorOptions, ConnectorState, NoopSink};

    fn connector(broker: &MemoryBroker) -> BusConnector {
        BusConnector::new(Arc::new(broker.clone()), ConnectorOptions::default(), Arc::new(NoopSink))
    }

    #[tokio::test]
    async fn test_connect_until_up_retries_then_connects() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let bus = connector(&broker);

        tokio::time::timeout(Duration::from_secs(1), connect_until_up(bus.clone(), Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(bus.state(), ConnectorState::Connected);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_pending_connect_loop() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let bus = connector(&broker);
        let handle = tokio::spawn(connect_until_up(bus.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(1), bus.close()).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(bus.state(), ConnectorState::Closed);
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test]
    async fn test_close_racing_first_connect_leaves_nothing_running() {
        let broker = MemoryBroker::new();
        let bus = connector(&broker);
        bus.register("s", |_p: Vec<u8>| async { lib_counter::Disposition::Acknowledge })
            .await
            .unwrap();
        let handle = tokio::spawn(connect_until_up(bus.clone(), Duration::from_millis(10)));

        tokio::time::timeout(Duration::from_secs(1), bus.close()).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(bus.state(), ConnectorState::Closed);
        assert!(bus.publish(b"x").await.is_err());
    }
}
