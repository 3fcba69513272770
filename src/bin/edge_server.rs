//! Edge connection server binary.
//!
//! Usage:
//!     edge-server [OPTIONS]
//!
//! This binary wires the session engine to the bundled in-memory
//! reference compiler and backend (feature `test-support`); it exists to
//! give the crate something runnable end to end, not as a production
//! compiler/backend integration.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edgecore::backend::mock::MockBackend;
use edgecore::compiler::mock::MockCompiler;
use edgecore::Session;

#[derive(Parser)]
#[command(
    name = "edge-server",
    version,
    about = "Edge connection server for the frontend protocol core"
)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 5656)]
    port: u16,

    /// Maximum number of compiled queries cached per session
    #[arg(long, default_value_t = 1000)]
    cache_capacity: usize,

    /// Enable verbose (debug-level) logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let compiler = Arc::new(MockCompiler);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "edge-server listening");

    let mut dbver: u64 = 1;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((socket, peer)) => {
                        let compiler = compiler.clone();
                        let cache_capacity = args.cache_capacity;
                        dbver = dbver.wrapping_add(1);
                        let session_dbver = dbver;
                        info!(%peer, "accepted connection");
                        tokio::spawn(async move {
                            let backend = MockBackend::new();
                            let session = Session::new(socket, compiler, backend, session_dbver, cache_capacity);
                            if let Err(e) = session.run().await {
                                warn!(%peer, error = %e, "session ended with an error");
                            } else {
                                info!(%peer, "session ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
}
