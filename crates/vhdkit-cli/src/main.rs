//! vhdkit CLI
//!
//! A tool for inspecting VHD/VHDX images and dumping their logical contents.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vhdkit_core::{DiskType, ImageOptions};
use vhdkit_formats::{open_image, DiskImage};

#[derive(Parser)]
#[command(name = "vhdkit", version, about = "Inspect and read VHD/VHDX images")]
struct Cli {
    /// Use memory-mapped I/O
    #[arg(long, global = true)]
    mmap: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display image metadata
    Info {
        /// Path to the image file
        image: PathBuf,
    },
    /// Read a byte range of the logical disk to stdout or a file
    Read {
        /// Path to the image file
        image: PathBuf,

        /// Parent image(s) for differencing chains, nearest first
        #[arg(long)]
        parent: Vec<PathBuf>,

        /// Logical offset to start reading at
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to read; defaults to the rest of the disk
        #[arg(long)]
        length: Option<u64>,

        /// Write the bytes to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = ImageOptions { use_mmap: cli.mmap };

    let result = match cli.command {
        Command::Info { image } => cmd_info(&image, &options),
        Command::Read {
            image,
            parent,
            offset,
            length,
            output,
        } => cmd_read(&image, &parent, offset, length, output.as_deref(), &options),
    };

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

fn cmd_info(path: &Path, options: &ImageOptions) -> Result<()> {
    let image = open_image(path, options)
        .with_context(|| format!("unable to open '{}'", path.display()))?;

    let (major, minor) = image.format_version();

    println!("Virtual disk image information:");
    println!("\tFormat:\t\t\t{} {}.{}", image.format(), major, minor);
    println!("\tDisk type\t\t: {}", image.disk_type());
    println!(
        "\tMedia size\t\t: {} ({} bytes)",
        format_bytes(image.media_size()),
        image.media_size()
    );
    println!("\tBytes per sector\t: {} bytes", image.bytes_per_sector());
    if image.block_size() != 0 {
        println!(
            "\tBlock size\t\t: {} ({} bytes)",
            format_bytes(u64::from(image.block_size())),
            image.block_size()
        );
    }
    println!("\tIdentifier\t\t: {}", image.identifier());

    if let Some(parent_identifier) = image.parent_identifier() {
        println!("\tParent identifier\t: {}", parent_identifier);
    }
    if let Some(parent_filename) = image.parent_filename() {
        println!("\tParent filename\t\t: {}", parent_filename);
    }
    if let Some(geometry) = image.geometry() {
        println!(
            "\tGeometry\t\t: {} cylinders, {} heads, {} sectors",
            geometry.cylinders, geometry.heads, geometry.sectors
        );
    }
    if image.saved_state() {
        println!("\tSaved state\t\t: yes");
    }
    println!();

    Ok(())
}

fn cmd_read(
    path: &Path,
    parents: &[PathBuf],
    offset: u64,
    length: Option<u64>,
    output: Option<&Path>,
    options: &ImageOptions,
) -> Result<()> {
    let mut image = open_chain(path, parents, options)?;

    let media_size = image.media_size();
    if offset > media_size {
        bail!(
            "offset {} is beyond the media size {}",
            offset,
            media_size
        );
    }
    let length = length
        .unwrap_or(media_size - offset)
        .min(media_size - offset);

    let stdout = std::io::stdout();
    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("unable to create '{}'", path.display()))?,
        ),
        None => Box::new(stdout.lock()),
    };

    let mut buffer = vec![0u8; (1 << 20).min(length.max(1) as usize)];
    let mut remaining = length;
    let mut position = offset;
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let count = image
            .read_at(position, &mut buffer[..want])
            .with_context(|| format!("read failed at offset {}", position))?;
        if count == 0 {
            break;
        }
        sink.write_all(&buffer[..count])?;
        position += count as u64;
        remaining -= count as u64;
    }
    sink.flush()?;
    tracing::debug!(offset, length, position, "read finished");

    Ok(())
}

/// Open an image and attach the given differencing-chain parents,
/// nearest first
fn open_chain(path: &Path, parents: &[PathBuf], options: &ImageOptions) -> Result<DiskImage> {
    let mut image = open_image(path, options)
        .with_context(|| format!("unable to open '{}'", path.display()))?;

    if image.disk_type() == DiskType::Differential && parents.is_empty() {
        bail!(
            "'{}' is a differencing image; pass its parent with --parent (hint: {})",
            path.display(),
            image.parent_basename().unwrap_or("unknown")
        );
    }

    // Build the chain from the far end so each attach sees a complete parent
    let mut chain: Option<DiskImage> = None;
    for parent_path in parents.iter().rev() {
        let mut parent = open_image(parent_path, options)
            .with_context(|| format!("unable to open parent '{}'", parent_path.display()))?;
        if let Some(grandparent) = chain.take() {
            parent
                .attach_parent(grandparent)
                .with_context(|| format!("unable to attach '{}'", parent_path.display()))?;
        }
        chain = Some(parent);
    }
    if let Some(parent) = chain {
        image
            .attach_parent(parent)
            .context("unable to attach the parent chain")?;
    }

    Ok(image)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1_048_576 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else if bytes < 1_073_741_824 {
        format!("{:.2} MiB", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GiB", bytes as f64 / 1_073_741_824.0)
    }
}
