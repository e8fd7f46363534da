use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use arpeggio::errors::ArpeggioError;
use arpeggio::{BackendKind, Config, ModelBuilder, QuantConfig};
use clap::Parser;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum BackendArg {
    /// Open-addressing hash tables: fastest lookup, more memory.
    Probing,
    /// Sorted bit-packed trie: smaller, supports quantization.
    Trie,
}

#[derive(Parser, Debug)]
#[clap(
    name = "compile",
    version,
    about = "A program to build a binary model from an ARPA text model."
)]
struct Args {
    /// ARPA text model file.
    #[clap(short = 'a', long)]
    arpa_in: PathBuf,

    /// File to which the binary model is output.
    #[clap(short = 'o', long)]
    model_out: PathBuf,

    /// Storage backend to build.
    #[clap(long, value_enum, default_value = "probing")]
    backend: BackendArg,

    /// Headroom factor for probing-table sizing; must be greater than 1.0.
    #[clap(long, default_value_t = 1.5)]
    probing_multiplier: f32,

    /// Quantize stored values to 8-bit codes (trie backend only).
    #[clap(short = 'q', long)]
    quantize: bool,

    /// Compress the output with Zstandard.
    #[clap(long)]
    zstd: bool,
}

#[derive(Debug, thiserror::Error)]
enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Model building failed: {0}")]
    Arpeggio(#[from] ArpeggioError),
}

fn main() -> Result<(), CompileError> {
    let args = Args::parse();

    let config = Config {
        backend: match args.backend {
            BackendArg::Probing => BackendKind::Probing,
            BackendArg::Trie => BackendKind::Trie,
        },
        probing_multiplier: args.probing_multiplier,
        quant: args.quantize.then(QuantConfig::default),
        ..Config::default()
    };

    println!("Compiling the model...");
    let inner = ModelBuilder::from_arpa_path(&args.arpa_in, &config)?;

    println!("Writing the model...");
    let file = File::create(&args.model_out)?;
    if args.zstd {
        let mut encoder = zstd::Encoder::new(file, 19)?;
        inner.write(&mut encoder)?;
        encoder.finish()?;
    } else {
        let mut writer = BufWriter::new(file);
        inner.write(&mut writer)?;
        writer.flush()?;
    }

    println!(
        "Successfully built the model to {}",
        args.model_out.display()
    );
    Ok(())
}
