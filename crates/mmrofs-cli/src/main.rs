//! # mmrofs CLI
//!
//! Operates on MMROFS partition image files: format an image, list and read
//! files, write, delete and rename them, and run the mount-time consistency
//! check. Every mutating command goes through the same transactional engine
//! the device uses, so images produced here are byte-compatible with it.

mod config;

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use config::Config;
use mmrofs_core::{FileFlash, Mmrofs, SystemClock};
use mmrofs_vfs::{OpenFlags, Vfs};

/// MMROFS partition image tool.
#[derive(Parser)]
#[command(name = "mmrofs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Partition image file (overrides config and MMROFS_IMAGE).
    #[arg(long, global = true)]
    image: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fully erased partition image.
    Format {
        /// Image size in bytes; must be a multiple of 4096.
        #[arg(long, default_value_t = 0x10_0000)]
        size: u32,
    },

    /// List all files.
    Ls,

    /// Write a file's payload to stdout.
    Cat {
        name: String,
    },

    /// Store a host file under the given name, replacing existing content.
    Put {
        name: String,
        source: PathBuf,

        /// Append after the current content instead of replacing it.
        #[arg(long)]
        append: bool,
    },

    /// Copy a file's payload into a host file.
    Get {
        name: String,
        dest: PathBuf,
    },

    /// Delete a file.
    Rm {
        name: String,
    },

    /// Rename a file, displacing any file at the destination.
    Mv {
        src: String,
        dst: String,
    },

    /// Print size and timestamps of a file.
    Stat {
        name: String,
    },

    /// Mount the image (running boot-time recovery) and report slot usage.
    Fsck,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MMROFS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let image = cli
        .image
        .or_else(|| config.image.clone())
        .context("no image given: pass --image, set MMROFS_IMAGE, or add it to mmrofs.toml")?;

    match cli.command {
        Commands::Format { size } => {
            FileFlash::create(&image, size)?;
            println!("formatted {} ({} bytes)", image.display(), size);
            Ok(())
        }
        Commands::Fsck => {
            let flash = FileFlash::open(&image)?;
            let fs = Mmrofs::mount(flash, Box::new(SystemClock::new()))?;
            let stats = fs.scan_stats()?;
            println!("{}: mounted clean", image.display());
            println!("  live:       {}", stats.live());
            println!("  free:       {}", stats.free);
            println!("  tombstone:  {}", stats.tombstone);
            println!("  erased:     {}", stats.erased);
            if stats.incomplete + stats.unknown + stats.bad_block > 0 {
                println!(
                    "  attention:  {} incomplete, {} unknown, {} bad",
                    stats.incomplete, stats.unknown, stats.bad_block
                );
            }
            Ok(())
        }
        command => {
            let flash = FileFlash::open(&image)
                .with_context(|| format!("opening image {}", image.display()))?;
            let vfs = Vfs::mount(flash, config.mount.clone())?;
            run(&vfs, command)
        }
    }
}

fn run(vfs: &Vfs<FileFlash>, command: Commands) -> Result<()> {
    match command {
        Commands::Ls => {
            let dir = vfs.opendir()?;
            while let Some(entry) = vfs.readdir(dir)? {
                let st = vfs.stat(&entry.name)?;
                println!("{:>10}  {:>12}  {}", st.size, st.mtime, entry.name);
            }
            vfs.closedir(dir)?;
            Ok(())
        }

        Commands::Cat { name } => {
            let data = read_file(vfs, &name)?;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }

        Commands::Get { name, dest } => {
            let data = read_file(vfs, &name)?;
            std::fs::write(&dest, &data)
                .with_context(|| format!("writing {}", dest.display()))?;
            println!("{} -> {} ({} bytes)", name, dest.display(), data.len());
            Ok(())
        }

        Commands::Put { name, source, append } => {
            let data = std::fs::read(&source)
                .with_context(|| format!("reading {}", source.display()))?;
            if data.is_empty() {
                bail!("refusing to store an empty file: the entry would never be created");
            }
            let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
            if !append {
                flags |= OpenFlags::TRUNCATE;
            }
            let fd = vfs.open(&name, flags)?;
            vfs.write(fd, &data)?;
            vfs.close(fd)?;
            println!("{} <- {} ({} bytes)", name, source.display(), data.len());
            Ok(())
        }

        Commands::Rm { name } => {
            vfs.unlink(&name)?;
            println!("removed {name}");
            Ok(())
        }

        Commands::Mv { src, dst } => {
            vfs.rename(&src, &dst)?;
            println!("{src} -> {dst}");
            Ok(())
        }

        Commands::Stat { name } => {
            let st = vfs.stat(&name)?;
            println!("name:  {name}");
            println!("size:  {}", st.size);
            println!("mtime: {}", st.mtime);
            println!("ctime: {}", st.ctime);
            Ok(())
        }

        Commands::Format { .. } | Commands::Fsck => unreachable!("handled before mount"),
    }
}

fn read_file(vfs: &Vfs<FileFlash>, name: &str) -> Result<Vec<u8>> {
    let fd = vfs.open(name, OpenFlags::READ)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = vfs.read(fd, &mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    vfs.close(fd)?;
    Ok(out)
}
