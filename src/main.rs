use clap::{Parser, Subcommand};
use nxio::codec::{get_codec, try_decompress, CodecId};
use nxio::format::{FileFormat, ResolutionContext};
use nxio::{Registry, Stream};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nxio", about = "Inspect, unpack and repack Switch game assets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a file resolves (compression, format, sizes)
    Info {
        input: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the entries of an archive
    List {
        input: PathBuf,
    },
    /// Extract every entry of an archive
    Extract {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Strip the outer compression layer of a file
    Decompress {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Compress a file with one of the built-in codecs
    Compress {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: yaz0 (default), zstd, lz4, brotli, lzma, none
        #[arg(short, long, default_value = "yaz0")]
        codec: String,
    },
}

#[derive(Serialize)]
struct Summary {
    path:              String,
    format:            Option<&'static str>,
    compression:       &'static str,
    compressed_size:   u64,
    decompressed_size: u64,
    magic:             String,
    entries:           Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let registry = Registry::global();

    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let summary = summarize(registry, &input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("── {} ─────────────────────────────────────────", summary.path);
                println!("  Format         {}", summary.format.unwrap_or("unknown"));
                println!("  Compression    {}", summary.compression);
                println!("  Compressed     {} B", summary.compressed_size);
                println!("  Decompressed   {} B", summary.decompressed_size);
                println!("  Magic          {}", summary.magic);
                if let Some(n) = summary.entries {
                    println!("  Entries        {}", n);
                }
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let format = open_archive(registry, &input)?;
            println!("Archive: {}", input.display());
            println!("{:<48} {:>12}  Magic", "Name", "Size");
            for entry in archive_entries(format.as_ref())? {
                let magic = hex::encode(&entry.data[..entry.data.len().min(4)]);
                println!("{:<48} {:>12}  {}", entry.file_name, entry.size(), magic);
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir } => {
            let format = open_archive(registry, &input)?;
            for entry in archive_entries(format.as_ref())? {
                let Some(relative) = entry.relative_path() else {
                    tracing::warn!(entry = %entry.file_name, "skipping entry that escapes the output directory");
                    continue;
                };
                let dest = output_dir.join(relative);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, &entry.data)?;
                println!("  extracted  {}", dest.display());
            }
            println!("Extracted to: {}", output_dir.display());
        }

        // ── Decompress ───────────────────────────────────────────────────────
        Commands::Decompress { input, output } => {
            let name = input.to_string_lossy();
            let decompressed = try_decompress(registry.compressions(), Stream::open(&input)?, &name)?;
            if !decompressed.is_compressed() {
                eprintln!("{} is not compressed; copying as-is", input.display());
            }
            let mut stream = decompressed.stream;
            fs::write(&output, stream.read_remaining()?)?;
            println!(
                "{} ({}, {} → {} B) → {}",
                input.display(),
                decompressed.compression.name(),
                decompressed.compressed_size,
                decompressed.decompressed_size,
                output.display()
            );
        }

        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress { input, output, codec } => {
            let codec = get_codec(parse_codec(&codec));
            let data = fs::read(&input)?;
            let packed = codec.compress_bytes(&data)?;
            fs::write(&output, &packed)?;
            println!("{} ({}, {} → {} B) → {}", input.display(), codec.name(), data.len(), packed.len(), output.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn summarize(registry: &Registry, path: &Path) -> Result<Summary, Box<dyn std::error::Error>> {
    let name = path.to_string_lossy().into_owned();
    let mut decompressed = try_decompress(registry.compressions(), Stream::open(path)?, &name)?;
    let magic = hex::encode(decompressed.stream.peek::<8>()?);

    let ctx = ResolutionContext {
        compressed_size: decompressed.compressed_size,
        decompressed_size: decompressed.decompressed_size,
        ..ResolutionContext::new().with_compression(decompressed.compression.clone())
    };
    let format = registry.open_stream(decompressed.stream, &name, ctx)?;

    Ok(Summary {
        path: name,
        format: format.as_ref().map(|f| f.description()),
        compression: decompressed.compression.name(),
        compressed_size: decompressed.compressed_size,
        decompressed_size: decompressed.decompressed_size,
        magic,
        entries: format.as_ref().and_then(|f| f.as_archive()).map(|a| a.entries().len()),
    })
}

fn open_archive(registry: &Registry, path: &Path) -> Result<Box<dyn FileFormat>, Box<dyn std::error::Error>> {
    registry
        .open_path(path, ResolutionContext::new())?
        .ok_or_else(|| format!("{}: unrecognised format", path.display()).into())
}

fn archive_entries(format: &dyn FileFormat) -> Result<&[nxio::format::ArchiveEntry], Box<dyn std::error::Error>> {
    format
        .as_archive()
        .map(|a| a.entries())
        .ok_or_else(|| format!("{} is not an archive", format.description()).into())
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to yaz0", s);
        CodecId::Yaz0
    })
}
