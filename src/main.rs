mod auth;
mod cart;
mod catalog;
mod checkout;
mod config;
mod coupon;
mod error;
mod http_api;
mod mongo;
mod order;
mod payments;
mod store;
mod util;

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments set the environment directly
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load();

    mongo::init_mongo_from_env().await?;

    http_api::run_http_server(config).await?;

    Ok(())
}
