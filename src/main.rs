use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use atomgit::{server, Config, GitStore, Model};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = GitStore::open(&config.gitdir)?;
    let model = Model::new(store)?;
    tracing::info!(gitdir = %config.gitdir.display(), "store loaded");

    let app = server::router(Arc::new(Mutex::new(model)));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!("starting AtomPub server on {}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}
