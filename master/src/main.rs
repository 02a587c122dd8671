mod handlers;
mod state;

use crate::state::AppState;
use std::{env, path::PathBuf};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATA_DIR: &str = "/data";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info,tower_http=info")),
        )
        .init();

    let data_dir = env::var("STAGECHAIN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
    let addr = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    let state = AppState::new(data_dir.clone());
    info!("directorio de datos: {}", data_dir.display());

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
