//! Publishes a single metric entry on the counter's bus, for smoke tests and
//! manual backfills.
//!
//! ```text
//! metric_publish --actor alice --action login
//! metric_publish --actor batch --action call-api-x --count 40 --timestamp 2024-03-01T12:00:00Z
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use lib_counter::connections::{RedisStreamOptions, RedisStreamTransport};
use lib_counter::{BusConnector, ConnectorOptions, MetricEntry, NoopSink};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(about = "Publish one metric entry to the distinct counter bus", version)]
struct Args {
    #[clap(long, env = "DISTINCT_BUS_HOST", default_value = "127.0.0.1", help = "Message bus host.")]
    bus_host: String,

    #[clap(long, env = "DISTINCT_BUS_PORT", default_value_t = 6379, help = "Message bus port.")]
    bus_port: u16,

    #[clap(long, env = "DISTINCT_BUS_USER", default_value = "", help = "Message bus user.")]
    bus_user: String,

    #[clap(long, env = "DISTINCT_BUS_PASSWORD", default_value = "", help = "Message bus password.")]
    bus_password: String,

    #[clap(long, env = "DISTINCT_EXCHANGE", default_value = "metrics", help = "Topic to publish to.")]
    exchange: String,

    #[clap(long, help = "Originating subject.")]
    actor: String,

    #[clap(long, help = "Counted action.")]
    action: String,

    #[clap(long, default_value_t = 1, help = "Weight of the event.")]
    count: i64,

    #[clap(long, help = "RFC 3339 event time. Defaults to now.")]
    timestamp: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log::LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()?;

    let entry = MetricEntry::new(
        args.actor,
        args.count,
        args.action,
        args.timestamp.unwrap_or_else(Utc::now),
    );
    let payload = entry.encode();
    // Reject what the consumers would reject.
    MetricEntry::decode(&payload)?;

    let url = RedisStreamTransport::url(&args.bus_host, args.bus_port, &args.bus_user, &args.bus_password);
    let transport = RedisStreamTransport::new(&url, RedisStreamOptions::default())?;
    let connector = BusConnector::new(
        Arc::new(transport),
        ConnectorOptions {
            topic: args.exchange,
            ..ConnectorOptions::default()
        },
        Arc::new(NoopSink),
    );

    connector.connect().await?;
    let published = connector.publish(&payload).await;
    connector.close().await?;
    published?;

    println!("{}", String::from_utf8_lossy(&payload));
    Ok(())
}
