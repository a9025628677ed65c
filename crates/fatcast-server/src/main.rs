//! fatcast-server binary.
//!
//! Reads a directory tree and presents it as a FAT32 network block
//! device. The block device can then be mounted normally, or exported
//! as a raw device (for example over the USB mass storage function)
//! without interfering with normal use of the directory.
//!
//! The image is synthesized: directory metadata lives in memory, file
//! contents are read from the host on demand. Files created after
//! startup are not included. Only writes to the FAT region of the
//! image are accepted.

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use anyhow::Context;
use clap::Parser;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use tokio::net::UnixStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fatcast_engine::geometry::{CLUSTER_SIZE, SECTOR_SIZE};
use fatcast_engine::{scan, Geometry, Volume};
use fatcast_server::device::NbdDevice;
use fatcast_server::{nbd, notify};

/// Present a directory tree as a FAT32 network block device.
#[derive(Parser, Debug)]
#[command(name = "fatcast-server", version, about)]
struct Args {
    /// Fork away from the shell and run as a daemon
    #[arg(long)]
    daemonize: bool,

    /// Network block device to attach to
    #[arg(long, default_value = "/dev/nbd0")]
    device: PathBuf,

    /// Host directory tree to present
    directory: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    // The image is sized from the host filesystem: as large as the
    // whole filesystem, with the free-space report capped at what the
    // host actually has left.
    let stat = nix::sys::statvfs::statvfs(&args.directory).with_context(|| {
        format!(
            "could not stat directory tree at {}",
            args.directory.display()
        )
    })?;
    let image_bytes = stat.fragment_size() as u64 * stat.blocks() as u64;
    let free_bytes = stat.fragment_size() as u64 * stat.blocks_available() as u64;

    let device = NbdDevice::open(&args.device)
        .with_context(|| format!("could not open {}", args.device.display()))?;

    let sectors = u32::try_from(image_bytes.div_ceil(SECTOR_SIZE as u64))
        .context("image size too large for a FAT32 volume")?;
    let geometry = Geometry::plan(sectors, SECTOR_SIZE)?;

    device
        .set_block_size(SECTOR_SIZE)
        .context("could not set block size")?;
    device
        .set_size_blocks(geometry.total_sectors as u64)
        .context("could not set image size")?;

    if args.daemonize {
        nix::sys::stat::umask(Mode::empty());
        nix::unistd::daemon(false, false).context("could not daemonize")?;
    }

    let (kernel_side, serve_side) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .context("could not create socket pair")?;
    device
        .set_socket(kernel_side.as_fd())
        .context("could not associate socket with device")?;

    // The kernel drives the device from this thread; NBD_DO_IT returns
    // only at disconnect, and serving is pointless after that.
    thread::spawn(move || {
        let _kernel_side = kernel_side;
        match device.run() {
            Ok(()) => {
                info!("device disconnected");
                std::process::exit(0);
            }
            Err(err) => {
                error!(%err, "device processing failed");
                std::process::exit(1);
            }
        }
    });

    notify::notify("STATUS=scanning directory tree");
    info!(directory = %args.directory.display(), "scanning");
    let mut volume = Volume::new(geometry, None)?;
    scan::populate(&mut volume, &args.directory).context("scanning directory tree")?;
    let free_clusters =
        u32::try_from(free_bytes / CLUSTER_SIZE as u64).unwrap_or(u32::MAX);
    volume.finalize(free_clusters);
    notify::notify("READY=1\nSTATUS=ready");
    info!("ready");

    // The engine is single-threaded; one task on a current-thread
    // runtime serves every request in arrival order. The runtime is
    // built only now so daemonizing above could not orphan it.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start runtime")?;
    runtime
        .block_on(async {
            let std_stream = std::os::unix::net::UnixStream::from(serve_side);
            std_stream.set_nonblocking(true)?;
            let mut stream = UnixStream::from_std(std_stream)?;
            nbd::serve(&mut stream, &mut volume).await
        })
        .context("serving requests")?;
    Ok(())
}
