//! Lifecycle driver: read the framed XML configuration from stdin, build
//! the images, mount the namespace, report the mountpoint on stdout, and
//! tear everything down when the launcher closes our stdin.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vmnetfs::fs::Namespace;
use vmnetfs::fuse::mount::mount_namespace;
use vmnetfs::{Config, Image, Log};

#[derive(Parser)]
#[command(name = "vmnetfs", version, about = "Demand-paged VM image filesystem")]
struct Cli {
    /// Mount point; a private temporary directory is created when omitted.
    #[arg(long, value_name = "DIR")]
    mountpoint: Option<PathBuf>,

    /// Read the configuration document from a file instead of the framed
    /// stdin protocol (for debugging).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let log = Log::new();
    // stdout carries the launcher protocol, so human-readable logs go to
    // stderr; the /log stream gets everything via the log layer.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmnetfs=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(log.layer())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli, &log).await {
        // Single error line on stdout is the failure half of the protocol.
        println!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log: &Log) -> anyhow::Result<()> {
    ignore_sigint()?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let config = match &cli.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_xml(&text)?
        }
        None => Config::read_framed(&mut stdin).await?,
    };

    let mut images = Vec::new();
    for image_cfg in &config.images {
        let image = Image::open(image_cfg)
            .await
            .with_context(|| format!("initializing image {:?}", image_cfg.name))?;
        images.push(Arc::new(image));
    }
    let ns = Arc::new(Namespace::build(config.censored_xml(), &images, log));

    let (mountpoint, scratch) = match cli.mountpoint {
        Some(dir) => (dir, None),
        None => {
            let dir = tempfile::Builder::new().prefix("vmnetfs-").tempdir()?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };
    let handle = mount_namespace(ns, &mountpoint)
        .await
        .with_context(|| format!("mounting at {}", mountpoint.display()))?;

    // Success report: a blank line, then the mountpoint path.
    println!();
    println!("{}", mountpoint.display());

    // The launcher signals teardown by closing our stdin.
    drain_to_eof(&mut stdin).await;
    info!("stdin closed, unmounting");
    for image in &images {
        image.close();
    }
    log.close();
    handle.unmount().await?;
    drop(scratch);
    Ok(())
}

/// SIGINT belongs to the launcher's terminal session; teardown only ever
/// comes through the stdin pipe.
fn ignore_sigint() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        tokio::spawn(async move {
            loop {
                sigint.recv().await;
            }
        });
    }
    Ok(())
}

async fn drain_to_eof<R: AsyncReadExt + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
