//! The lantuya daemon: discovery listener, device controller and HTTP
//! control surface, all on one cooperative event loop.

use clap::Parser;
use lantuya::runtime::{self, ControllerHandle};
use lantuya::{http, TuyaError};
use log::{error, info};
use std::path::PathBuf;

/// LAN-local control of Tuya devices, no cloud required
#[derive(Parser, Debug)]
#[command(name = "lantuya", version)]
struct Args {
    /// Path of the persisted configuration blob
    #[arg(long, default_value = "tuya.json")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// HTTP listen port
    #[arg(long, default_value_t = 8090)]
    port: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = serve(args).await {
        error!("lantuya failed: {e}");
        std::process::exit(1);
    }
}

async fn serve(args: Args) -> Result<(), TuyaError> {
    let (handle, requests) = ControllerHandle::new();
    let router = http::router(handle);

    let bind = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("lantuya {} listening on http://{bind}", lantuya::version());

    tokio::select! {
        result = runtime::run(args.config, requests) => result,
        result = axum::serve(listener, router) => result.map_err(TuyaError::from),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
