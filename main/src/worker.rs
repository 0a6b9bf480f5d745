use std::sync::Arc;
use std::time::Duration;

use analysis_pipeline::spawn_stage_workers;
use common::{
    queue::amqp::AmqpTransport, storage::db::SurrealDbClient, utils::config::get_config,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let transport = Arc::new(
        AmqpTransport::connect_with_retry(
            &config.amqp_addr,
            Duration::from_secs(config.connect_retry_secs),
        )
        .await?,
    );

    let handles = spawn_stage_workers(db, transport.clone(), &config)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping stage workers");
    for handle in &handles {
        handle.abort();
    }
    transport.close().await?;

    Ok(())
}
