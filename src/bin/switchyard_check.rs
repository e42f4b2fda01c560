//! switchyard-check: broker connectivity check
//!
//! Connects to the configured broker, reports its health and optionally
//! publishes one message.
//!
//! ## Usage
//! ```text
//! switchyard-check                      # health only
//! switchyard-check orders '{"id": 1}'   # health, then publish
//! ```
//!
//! ## Configuration
//! - SWITCHYARD_CONFIG: Path to a YAML config file (optional)
//! - SWITCHYARD_*: Environment overrides, e.g. SWITCHYARD_TYPE=amqp
//! - SWITCHYARD_LOG: Log filter (default: info)
//!
//! Exits 0 when the broker is healthy and the publish (if any) succeeded,
//! 1 otherwise.

use std::process::ExitCode;

use tracing::{error, info};

use switchyard::{create_broker, init_tracing, BrokerConfig, EventMessage};

async fn check(publish: Option<(String, String)>) -> Result<bool, Box<dyn std::error::Error>> {
    let config = BrokerConfig::load(None)?;
    let broker = create_broker(&config)?;

    broker.connect().await?;
    let healthy = broker.health_check().await;
    println!("{}: {}", broker.transport_name(), if healthy { "healthy" } else { "unhealthy" });

    let mut ok = healthy;
    if let Some((topic, payload)) = publish {
        let value: serde_json::Value = serde_json::from_str(&payload)?;
        match broker.publish(EventMessage::new(topic.clone(), value)).await {
            Ok(()) => info!(topic = %topic, "Test message published"),
            Err(e) => {
                error!(topic = %topic, error = %e, "Test publish failed");
                ok = false;
            }
        }
    }

    broker.disconnect().await?;
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let publish = match (args.next(), args.next()) {
        (Some(topic), Some(payload)) => Some((topic, payload)),
        (None, None) => None,
        _ => {
            eprintln!("usage: switchyard-check [<topic> <json>]");
            return ExitCode::FAILURE;
        }
    };

    match check(publish).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Connectivity check failed");
            ExitCode::FAILURE
        }
    }
}
