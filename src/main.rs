use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ikats::backend::memory::MemoryBackend;
use ikats::config::SessionConfig;
use ikats::emulator;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "In-memory emulator of the IKATS REST backends", long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,ikats=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let defaults = SessionConfig::default();

    println!("--- IKATS Emulator ---");
    println!("Initializing In-Memory Backend...");
    let backend = Arc::new(MemoryBackend::new());

    let (addr, server) = match emulator::bind(backend, args.addr) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("Could not bind to {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };
    tokio::spawn(server);

    println!("Datamodel API on http://{}{}", addr, defaults.tdm_path);
    println!("OpenTSDB API on  http://{}{}", addr, defaults.tsdb_path);
    println!("Emulator is Ready.");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Can't listen for shutdown signal: {}", e);
    }
    println!("Shutting down.");
}
