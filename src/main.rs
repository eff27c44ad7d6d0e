//! Command-line front end: read a JSON array of input records, run the
//! enrichment engine against the configured provider, and print the output
//! rows and run summary as JSON on stdout.

use rust_skiptrace_batch::config::{DeliveryMode, EngineConfig};
use rust_skiptrace_batch::engine::EnrichmentEngine;
use rust_skiptrace_batch::models::InputRecord;
use rust_skiptrace_batch::webhook;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_skiptrace_batch=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let input_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: rust-skiptrace-batch <records.json>"))?;

    let raw = std::fs::read_to_string(&input_path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", input_path, e))?;
    let records: Vec<InputRecord> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a JSON array of records: {}", input_path, e))?;
    tracing::info!("Loaded {} record(s) from {}", records.len(), input_path);

    let config = EngineConfig::from_env()?;
    let delivery_mode = config.delivery_mode;
    let engine = EnrichmentEngine::new(config)?;

    // Webhook mode needs the delivery endpoint up before anything is
    // submitted.
    if delivery_mode == DeliveryMode::Webhook {
        let port: u16 = std::env::var("SKIPTRACE_WEBHOOK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let app = webhook::router(engine.webhook_state());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!("Webhook receiver listening on port {}", port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Webhook server failed: {}", e);
            }
        });
    }

    let outcome = engine.run(records).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
