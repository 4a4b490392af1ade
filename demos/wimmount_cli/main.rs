//! Minimal CLI driving [`wim_mount::mount`]/[`wim_mount::unmount`], in the
//! style of the teacher's `demofs`/`mirrorfs` example binaries: a thin
//! `clap` front end over the library, with an in-memory archive standing in
//! for a real WIM codec (spec §1 "external collaborators").

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use wim_mount::codec::InMemoryArchiveCodec;
use wim_mount::{mount, unmount, MountFlags, OpenArchive, StreamInterface, UnmountFlags};

#[derive(Parser)]
#[command(name = "wimmount-cli", about = "mount/unmount a WIM image as a directory tree")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount image `image` at `mount_dir`, blocking until unmounted.
    Mount {
        mount_dir: PathBuf,
        #[arg(long, default_value_t = 1)]
        image: u32,
        #[arg(long)]
        read_write: bool,
        #[arg(long, value_enum, default_value = "xattr")]
        stream_interface: CliStreamInterface,
    },
    /// Unmount a previously mounted directory.
    Unmount {
        mount_dir: PathBuf,
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        check_integrity: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliStreamInterface {
    None,
    Windows,
    Xattr,
}

impl From<CliStreamInterface> for StreamInterface {
    fn from(value: CliStreamInterface) -> Self {
        match value {
            CliStreamInterface::None => StreamInterface::None,
            CliStreamInterface::Windows => StreamInterface::Windows,
            CliStreamInterface::Xattr => StreamInterface::Xattr,
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Mount { mount_dir, image, read_write, stream_interface } => {
            let archive = OpenArchive::new(Arc::new(InMemoryArchiveCodec::new()));
            let flags = MountFlags { read_write, debug: false, stream_interface: stream_interface.into() };
            mount(archive, image, &mount_dir, flags).await.map_err(|err| err.to_string())
        }
        Command::Unmount { mount_dir, commit, check_integrity } => {
            let flags = UnmountFlags { commit, check_integrity };
            unmount(&mount_dir, flags).await.map_err(|err| err.to_string())
        }
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("wimmount-cli: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
