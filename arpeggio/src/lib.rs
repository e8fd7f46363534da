//! # Arpeggio
//!
//! Arpeggio is a compact n-gram language-model engine: it ingests a model
//! trained offline and exported in the ARPA text format, builds one of two
//! interchangeable storage backends (hash probing or a sorted, bit-packed
//! trie), and answers per-token log-probability queries at high throughput
//! through the standard backoff algorithm. Model files load zero-copy via
//! memory mapping, so start-up cost is independent of model size.
//!
//! ## Examples
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use arpeggio::{Config, Model, ModelBuilder, Scorer};
//!
//! let arpa = "\\data\\
//! ngram 1=5
//! ngram 2=3
//!
//! \\1-grams:
//! -1.2\t<unk>
//! -0.8\t<s>\t-0.4
//! -0.9\t</s>
//! -0.6\tlanguage\t-0.3
//! -0.7\tmodeling\t-0.2
//!
//! \\2-grams:
//! -0.3\t<s> language
//! -0.4\tlanguage modeling
//! -0.5\tmodeling </s>
//!
//! \\end\\
//! ";
//!
//! let inner = ModelBuilder::from_arpa_reader(arpa.as_bytes(), &Config::default())?;
//!
//! let mut buffer = Vec::new();
//! inner.write(&mut buffer)?;
//!
//! let model = Model::read(buffer.as_slice())?;
//! assert_eq!(model.order(), 2);
//! assert!(model.contains("language"));
//! assert!(!model.contains("jazz"));
//!
//! let scorer = Scorer::new(model);
//! let total = scorer.score("language modeling")?;
//! let sum: f32 = scorer.full_scores("language modeling")?.iter().map(|s| s.prob).sum();
//! assert!((total - sum).abs() < 1e-4);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

#[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))]
compile_error!("`target_pointer_width` must be 32 or 64");

pub mod arpa;
mod bits;
pub mod common;
pub mod errors;
mod hash;
pub mod model;
pub mod scorer;
pub mod state;

pub use model::{BackendKind, Config, Model, ModelBuilder, QuantConfig};
pub use scorer::{FullScore, Scorer, WordScore};
pub use state::State;

/// Version number of this library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
