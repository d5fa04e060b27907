//! The peer binary: a thin CLI wrapper around [`minibit::peer`].
//!
//! Either `--file-path` (seed an existing file) or `--file-name` together
//! with `--file-len` (download a file not yet on disk) must be given.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "peer", version, about)]
struct Args {
    /// Host the tracker is listening on.
    #[arg(long, default_value = "127.0.0.1")]
    tracker_host: String,

    /// Port the tracker is listening on.
    #[arg(long, default_value_t = 6881)]
    tracker_port: u16,

    /// Host this peer's accept loop binds to for inbound connections.
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    /// Port this peer's accept loop binds to.
    #[arg(long)]
    listen_port: u16,

    /// Path to an existing file to seed. Mutually exclusive with
    /// `--file-name`/`--file-len`.
    #[arg(long)]
    file_path: Option<PathBuf>,

    /// Name to register a download under. Requires `--file-len`.
    #[arg(long)]
    file_name: Option<String>,

    /// Total length, in bytes, of the file being downloaded. Required with
    /// `--file-name`.
    #[arg(long)]
    file_len: Option<u64>,

    /// Directory completed downloads are written into.
    #[arg(long, default_value = "downloads")]
    downloads_dir: PathBuf,

    /// Block size, in bytes.
    #[arg(long, default_value_t = minibit::DEFAULT_BLOCK_LEN)]
    block_size: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let tracker_addr: SocketAddr =
        format!("{}:{}", args.tracker_host, args.tracker_port).parse()?;
    let listen_addr: SocketAddr = format!("{}:{}", args.listen_host, args.listen_port).parse()?;

    let mut conf =
        minibit::conf::PeerConf::new(tracker_addr, listen_addr, args.downloads_dir.clone());
    conf.block_size = args.block_size;

    let own_id = uuid::Uuid::new_v4().to_string();
    log::info!("Starting peer {}", own_id);

    let handle = match (args.file_path, args.file_name, args.file_len) {
        (Some(path), file_name, _) => {
            let file_name = file_name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string())
            });
            log::info!("Seeding {:?} as {}", path, file_name);
            minibit::peer::seed(conf, own_id, file_name, &path).await?
        }
        (None, Some(file_name), Some(file_len)) => {
            log::info!("Downloading {} ({} bytes)", file_name, file_len);
            let handle = minibit::peer::download(conf, own_id, file_name.clone(), file_len).await?;
            handle.wait_until_complete().await;
            let dst = args.downloads_dir.join(&file_name);
            handle.save_to(&dst).await?;
            log::info!("Saved completed download to {:?}", dst);
            handle
        }
        _ => {
            return Err("either --file-path, or --file-name with --file-len, is required".into());
        }
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Received shutdown signal");
    handle.shutdown();

    Ok(())
}
