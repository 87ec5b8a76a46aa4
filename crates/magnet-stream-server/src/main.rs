mod api;
mod config;
mod engine;
mod error;
mod magnet;
mod openapi;
mod range_stream;
mod session;
mod startup;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "magnet-stream-server", version = VERSION)]
pub(crate) struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:3000
    #[arg(long)]
    pub(crate) bind: Option<SocketAddr>,

    /// Directory holding downloaded torrent content
    #[arg(long)]
    pub(crate) content_dir: Option<PathBuf>,

    /// Optional server config file (TOML)
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,magnet_stream_server=info")
        }))
        .init();

    startup::run(args).await
}
