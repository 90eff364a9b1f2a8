use std::env;
use std::sync::Arc;

use clap::Parser;
use marketplace_sync::engine::MemMarket;
use marketplace_sync::model::{Identity, Principal};
use marketplace_sync::server::Router;
use tokio::signal;

/// Development backend serving an in-memory marketplace over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    port: Option<String>,

    /// Hex principal granted the admin role.
    #[arg(long)]
    admin: Option<String>,

    /// Load a small demo catalog.
    #[arg(long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let port = args
        .port
        .or_else(|| env::var("MARKETPLACE_PORT").ok())
        .unwrap_or_else(|| "7101".to_string());

    let mut market = MemMarket::new();
    if let Some(hex) = &args.admin {
        let admin = Identity::authenticated(Principal::from_hex(hex)?);
        println!("Granting admin role to {}", admin);
        market = market.with_admin(admin);
    }
    if args.seed {
        market.seed_demo();
    }

    let router = Router::new(Arc::new(market));

    println!("Starting marketplace dev backend...");
    println!("Listening on :{} (TCP)", port);

    tokio::select! {
        res = router.listen(&port) => {
            if let Err(e) = res {
                eprintln!("TCP server failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            println!("\nShutdown signal received. Exiting.");
        }
    }

    Ok(())
}
