//! Strata gRPC server.
//!
//! A standalone binary serving the engine over gRPC, backed by Postgres
//! when `--db` is given and by the in-memory store otherwise.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing::info;

use strata::engine::StrataEngine;
use strata::storage::{FactStore, MemoryStore, PgStore};
use strata::transport::StrataServiceImpl;

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Postgres connection string; in-memory store when absent
    db: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".parse().expect("static default address"),
            db: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    config.addr = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("error: invalid listen address: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("error: --listen requires a value");
                    std::process::exit(1);
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    config.db = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("error: --db requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("strata-server - Strata gRPC server");
                println!();
                println!("USAGE:");
                println!("    strata-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -l, --listen <ADDR>   Address to listen on [default: 127.0.0.1:50051]");
                println!("    -d, --db <URL>        Postgres connection string [default: in-memory]");
                println!("    -h, --help            Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();
    println!("strata-server v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn FactStore> = match &config.db {
        Some(url) => {
            info!("connecting to postgres backend");
            Arc::new(PgStore::connect(url).await?)
        }
        None => {
            info!("using in-memory backend (facts will not survive restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(StrataEngine::new(store));
    let svc = StrataServiceImpl::new(engine).into_server();

    info!(addr = %config.addr, "listening");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}
