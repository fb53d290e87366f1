use crate::distinct_logic::state::AppState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use lib_counter::CounterError;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Rolls up the last completed period before `reference` and records its key.
pub async fn run_rollup(state: &AppState, reference: DateTime<Utc>) -> Result<String, CounterError> {
    let key = state.engine.rollup(reference).await?;
    state.set_latest_summary(key.clone()).await;
    Ok(key)
}

/// Starts a scheduler firing `run_rollup` on `cron` (six fields, UTC).
pub async fn start(cron: &str, state: AppState) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron.to_string(), move |_uuid, _lock| {
        let state = state.clone();
        Box::pin(async move {
            match run_rollup(&state, Utc::now()).await {
                Ok(key) => log::info!("Scheduled rollup wrote {}", key),
                Err(CounterError::NoCompletedPeriod(t)) => {
                    log::warn!("Scheduled rollup skipped: no completed period before {}", t)
                }
                Err(e) => log::error!("Scheduled rollup failed: {}", e),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    log::info!("Rollup scheduled with '{}'", cron);
    Ok(scheduler)
}
