use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;

use arpeggio::errors::ArpeggioError;
use arpeggio::{Model, Scorer};
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
    name = "score",
    version,
    about = "A program to score sentences from stdin with a binary model."
)]
struct Args {
    /// Binary model file; `.zst` files are decompressed transparently.
    #[clap(short = 'm', long)]
    model_in: PathBuf,

    /// Print per-token matched lengths and probabilities.
    #[clap(short = 'v', long)]
    verbose: bool,
}

#[derive(Debug, thiserror::Error)]
enum ScoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Model loading failed: {0}")]
    Arpeggio(#[from] ArpeggioError),
}

fn main() -> Result<(), ScoreError> {
    let args = Args::parse();

    let model = if args.model_in.extension().and_then(|e| e.to_str()) == Some("zst") {
        Model::from_zstd(&args.model_in)?
    } else {
        Model::from_path(&args.model_in)?
    };
    eprintln!(
        "Loaded an order-{} model ({:?} backend, {} words)",
        model.order(),
        model.backend_kind(),
        model.vocab_len()
    );

    let scorer = Scorer::new(model);
    let mut worker = scorer.new_worker();

    if atty::is(atty::Stream::Stdin) {
        eprintln!("Reading sentences from stdin...");
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        worker.reset_sentence(&line);
        worker.score()?;
        if args.verbose {
            let tokens = line.split_whitespace().chain(std::iter::once("</s>"));
            for (token, entry) in tokens.zip(worker.word_scores()) {
                write!(out, "{}={} {}\t", token, entry.ngram_length, entry.prob)?;
            }
            writeln!(out)?;
        }
        let oovs = worker.word_scores().iter().filter(|s| s.oov).count();
        writeln!(out, "Total: {} OOV: {}", worker.total(), oovs)?;
    }
    out.flush()?;
    Ok(())
}
