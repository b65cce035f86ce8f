use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use eventrom_core::compression::{compress, compressed_length, decompress};
use eventrom_core::{compile_script_from_str, EventSession, RomImage, RomLayout};

#[derive(Debug, Parser)]
#[command(name = "eventrom", version, about = "Event script and free space tooling for ROM images")]
struct Args {
    /// JSON file overriding the default image layout.
    #[arg(long, global = true)]
    layout: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decompress the block at a file offset.
    Decompress {
        #[arg(long)]
        rom: PathBuf,
        #[arg(long, value_parser = parse_number)]
        offset: usize,
        #[arg(long)]
        output: PathBuf,
    },

    /// Compress a raw file into a block.
    Compress {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Print the disassembled event script of a location.
    DumpScript {
        #[arg(long)]
        rom: PathBuf,
        #[arg(long, value_parser = parse_location)]
        location: u16,
    },

    /// Assemble mnemonics into raw command bytes.
    Assemble {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Report the free and used segments of an image as JSON.
    FreeSpace {
        #[arg(long)]
        rom: PathBuf,
    },
}

fn parse_number(s: &str) -> Result<usize, String> {
    let res = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else {
        s.parse::<usize>()
    };
    res.map_err(|e| format!("'{}' is not a number: {}", s, e))
}

fn parse_location(s: &str) -> Result<u16, String> {
    let n = parse_number(s)?;
    u16::try_from(n).map_err(|_| format!("location {:#X} does not fit in 16 bits", n))
}

fn load_layout(path: Option<&Path>) -> eventrom_core::Result<RomLayout> {
    match path {
        Some(path) => {
            let layout = RomLayout::load(path)?;
            info!("Loaded layout from {:?}", path);
            Ok(layout)
        }
        None => Ok(RomLayout::default()),
    }
}

fn run(args: Args) -> eventrom_core::Result<()> {
    let layout = load_layout(args.layout.as_deref())?;

    match args.command {
        Command::Decompress {
            rom,
            offset,
            output,
        } => {
            let data = fs::read(&rom)?;
            let len = compressed_length(&data, offset)?;
            let out = decompress(&data, offset)?;
            fs::write(&output, &out)?;
            info!(
                "{} compressed bytes at {:#X} expanded to {} bytes",
                len,
                offset,
                out.len()
            );
        }

        Command::Compress { input, output } => {
            let data = fs::read(&input)?;
            let block = compress(&data)?;
            fs::write(&output, &block)?;
            info!("{} bytes compressed to {} bytes", data.len(), block.len());
        }

        Command::DumpScript { rom, location } => {
            let image = RomImage::load(&rom, layout)?;
            let mut session = EventSession::new(image);
            let script = session.get(location)?;
            println!("{}", script.disassemble()?);
        }

        Command::Assemble { input, output } => {
            let src = fs::read_to_string(&input)?;
            let bytes = compile_script_from_str(&src)?;
            fs::write(&output, &bytes)?;
            info!("assembled {} bytes", bytes.len());
        }

        Command::FreeSpace { rom } => {
            let image = RomImage::load(&rom, layout)?;
            let segments: Vec<_> = image.space().segments().collect();
            println!("{}", serde_json::to_string_pretty(&segments)?);
            info!(
                "{:#X} bytes free, {:#X} bytes used",
                image.space().free_bytes(),
                image.space().used_bytes()
            );
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("eventrom_core=info,EventRom_CLI=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
