//! The tracker binary: a thin CLI wrapper around [`minibit::tracker`].

use std::net::SocketAddr;

use clap::Parser;

/// Runs a MiniBit tracker.
#[derive(Parser, Debug)]
#[command(name = "tracker", version, about)]
struct Args {
    /// Host to bind the tracker's listener to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the tracker's listener to.
    #[arg(long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let conf = minibit::conf::TrackerConf::new(listen_addr);

    let handle = minibit::tracker::spawn(conf).await?;
    log::info!("Tracker running on {}", handle.local_addr);

    tokio::signal::ctrl_c().await?;
    log::info!("Received shutdown signal");
    handle.shutdown();

    Ok(())
}
