//! The language model: vocabulary, storage backend, and binary format.
pub mod builder;
pub(crate) mod config;
pub(crate) mod quantize;
pub(crate) mod search;
pub(crate) mod vocabulary;

use std::fs::File;
use std::io::{Read, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use rkyv::rancor::Error;
use rkyv::util::AlignedVec;
use rkyv::{
    Archive, Deserialize, Serialize, access, access_unchecked, api::serialize_using,
    ser::Serializer, ser::allocator::Arena, ser::sharing::Share, ser::writer::IoWriter,
    util::with_arena,
};

use crate::common::{MAX_ORDER, RESERVED_WORDS, WordId};
use crate::errors::{ArpeggioError, Result};
use crate::model::search::{ArchivedSearchWrapper, SearchWrapper};
use crate::model::vocabulary::{ArchivedVocabulary, Vocabulary};

pub use crate::model::builder::ModelBuilder;
pub use crate::model::config::{BackendKind, Config};
pub use crate::model::quantize::QuantConfig;

/// Magic bytes identifying an Arpeggio model file, format version
/// included.
pub const MODEL_MAGIC: &[u8] = b"ArpeggioNgramModel 0.1\n";

const MODEL_MAGIC_LEN: usize = MODEL_MAGIC.len();
const RKYV_ALIGNMENT: usize = 16;
const PADDING_LEN: usize = (RKYV_ALIGNMENT - (MODEL_MAGIC_LEN % RKYV_ALIGNMENT)) % RKYV_ALIGNMENT;
const DATA_START: usize = MODEL_MAGIC_LEN + PADDING_LEN;

/// Inner data of [`Model`]: the header counts, the vocabulary, and the
/// active storage backend. Immutable once built.
#[derive(Archive, Serialize, Deserialize)]
pub struct ModelInner {
    counts: Vec<u64>,
    vocab: Vocabulary,
    search: SearchWrapper,
}

impl std::fmt::Debug for ModelInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInner")
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

impl ModelInner {
    pub(crate) fn new(counts: Vec<u64>, vocab: Vocabulary, search: SearchWrapper) -> Self {
        Self {
            counts,
            vocab,
            search,
        }
    }

    /// The maximum n-gram order of the model.
    #[inline(always)]
    pub fn order(&self) -> usize {
        self.counts.len()
    }

    #[inline(always)]
    pub(crate) fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    #[inline(always)]
    pub(crate) fn search(&self) -> &SearchWrapper {
        &self.search
    }

    /// Serializes the model to a writer in the Arpeggio binary format:
    /// the magic line, alignment padding, then the archived structure.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// use arpeggio::{Config, Model, ModelBuilder};
    ///
    /// let arpa = "\\data\\\nngram 1=3\nngram 2=1\n\n\\1-grams:\n-1.0\t<unk>\n-0.7\t<s>\t-0.4\n-0.9\t</s>\n\n\\2-grams:\n-0.5\t<s> </s>\n\n\\end\\\n";
    /// let inner = ModelBuilder::from_arpa_reader(arpa.as_bytes(), &Config::default())?;
    ///
    /// let mut buffer = Vec::new();
    /// inner.write(&mut buffer)?;
    ///
    /// let model = Model::read(buffer.as_slice())?;
    /// assert_eq!(model.order(), 2);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// This function will return an error if writing to `wtr` fails or
    /// the serialization process encounters an error.
    pub fn write<W>(&self, mut wtr: W) -> Result<()>
    where
        W: Write,
    {
        wtr.write_all(MODEL_MAGIC)?;

        let padding_bytes = vec![0xFF; PADDING_LEN];
        wtr.write_all(&padding_bytes)?;

        with_arena(|arena: &mut Arena| {
            let writer = IoWriter::new(&mut wtr);
            let mut serializer = Serializer::new(writer, arena.acquire(), Share::new());
            serialize_using::<_, Error>(self, &mut serializer)
        })
        .map_err(|e| {
            ArpeggioError::invalid_format("model", format!("serialization failed: {e}"))
        })?;

        Ok(())
    }
}

impl ArchivedModelInner {
    #[inline(always)]
    pub(crate) fn vocab(&self) -> &ArchivedVocabulary {
        &self.vocab
    }

    #[inline(always)]
    pub(crate) fn search(&self) -> &ArchivedSearchWrapper {
        &self.search
    }

    #[inline(always)]
    pub(crate) fn order(&self) -> usize {
        self.counts.len()
    }
}

// Owns the backing memory (mmap or heap) of an archived model.
enum ModelBuffer {
    Mmap(Mmap),
    Aligned(AlignedVec<16>),
}

/// A model backed by an archived buffer, accessed zero-copy.
pub struct ArchivedModel {
    _buffer: ModelBuffer,
    data: &'static ArchivedModelInner,
}

impl Deref for ArchivedModel {
    type Target = ArchivedModelInner;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

/// A read-only n-gram language model.
///
/// A model is either `Owned` (freshly built in memory) or `Archived`
/// (loaded zero-copy from a model file, usually memory-mapped). Both
/// forms answer the same queries; loading records which backend was
/// built and reconstructs it without caller involvement.
///
/// A model is immutable and safe to share across threads; per-sentence
/// scoring state lives in [`Worker`](crate::scorer::Worker)s, never here.
pub enum Model {
    /// Zero-copy view over a loaded model file.
    Archived(ArchivedModel),
    /// Heap-allocated model, typically straight from the builder.
    Owned(Arc<ModelInner>),
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Model::Archived(_) => f.debug_tuple("Archived").finish(),
            Model::Owned(inner) => f.debug_tuple("Owned").field(inner).finish(),
        }
    }
}

pub(crate) enum ModelInnerRef<'a> {
    Archived(&'a ArchivedModelInner),
    Owned(&'a ModelInner),
}

impl Model {
    /// Creates a model from freshly built [`ModelInner`] data.
    pub fn from_inner(inner: ModelInner) -> Self {
        Self::Owned(Arc::new(inner))
    }

    /// Serializes the model to a writer in the Arpeggio binary format.
    ///
    /// # Errors
    ///
    /// This function will return an error if writing fails.
    ///
    /// # Panics
    ///
    /// Panics if called on an already archived model; write the source
    /// file out instead of re-serializing a zero-copy view.
    pub fn write<W>(&self, wtr: W) -> Result<()>
    where
        W: Write,
    {
        match self {
            Self::Owned(inner) => inner.write(wtr),
            Self::Archived(_) => unreachable!(),
        }
    }

    /// Loads a model from a reader into an aligned heap buffer.
    ///
    /// This is the fallback for sources that have no path (network
    /// streams, in-memory buffers). Loading from a file should prefer
    /// [`from_path`](Self::from_path), which memory-maps instead of
    /// copying.
    ///
    /// # Errors
    ///
    /// Returns a format error when the magic line does not match this
    /// crate's version or the archived data fails validation.
    pub fn read<R>(mut rdr: R) -> Result<Self>
    where
        R: Read,
    {
        let mut magic = [0u8; MODEL_MAGIC_LEN];
        rdr.read_exact(&mut magic)?;
        if magic != *MODEL_MAGIC {
            return Err(ArpeggioError::invalid_format(
                "model",
                "the magic bytes of the input model mismatch; not an arpeggio model or an incompatible format version",
            ));
        }

        let mut padding = [0u8; PADDING_LEN];
        rdr.read_exact(&mut padding)?;

        let mut buffer = Vec::new();
        rdr.read_to_end(&mut buffer)?;

        let mut aligned_bytes = AlignedVec::with_capacity(buffer.len());
        aligned_bytes.extend_from_slice(&buffer);

        let archived = access::<ArchivedModelInner, Error>(&aligned_bytes).map_err(|e| {
            ArpeggioError::invalid_format(
                "model",
                format!("validation failed; the model file may be corrupted or incompatible: {e}"),
            )
        })?;
        validate_header(archived)?;

        // SAFETY: AlignedVec guarantees correct alignment for
        // ArchivedModelInner, and the buffer lives as long as the view.
        let data: &'static ArchivedModelInner = unsafe { &*(archived as *const _) };

        Ok(Self::Archived(ArchivedModel {
            _buffer: ModelBuffer::Aligned(aligned_bytes),
            data,
        }))
    }

    /// Loads a model from a file path using memory-mapping.
    ///
    /// No parsing happens beyond the magic line and header validation,
    /// so loading is near-instant regardless of model size; resident
    /// memory is governed by OS paging of the mapped file. If the
    /// mapped data is misaligned for zero-copy access, the file is
    /// re-read into an aligned heap buffer.
    ///
    /// # Errors
    ///
    /// Returns a format error when the file is not an arpeggio model of
    /// this format version, fails archive validation, or declares an
    /// order outside 2..=[`MAX_ORDER`].
    pub fn from_path<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            ArpeggioError::invalid_config("path", format!("failed to open the model file: {e}"))
        })?;
        let mut magic = [0u8; MODEL_MAGIC_LEN];
        file.read_exact(&mut magic)?;
        if magic != *MODEL_MAGIC {
            return Err(ArpeggioError::invalid_format(
                "model",
                "the magic bytes of the input model mismatch; not an arpeggio model or an incompatible format version",
            ));
        }

        let mmap = unsafe { Mmap::map(&file)? };
        let Some(data_bytes) = mmap.get(DATA_START..) else {
            return Err(ArpeggioError::invalid_format(
                "model",
                "model file too small or truncated",
            ));
        };

        match access::<ArchivedModelInner, Error>(data_bytes) {
            Ok(archived) => {
                validate_header(archived)?;
                let data: &'static ArchivedModelInner = unsafe { &*(archived as *const _) };
                Ok(Self::Archived(ArchivedModel {
                    _buffer: ModelBuffer::Mmap(mmap),
                    data,
                }))
            }
            Err(_) => {
                // The mapping may merely be misaligned; retry through an
                // aligned copy before giving up.
                let mut aligned_bytes = AlignedVec::with_capacity(data_bytes.len());
                aligned_bytes.extend_from_slice(data_bytes);

                let archived = access::<ArchivedModelInner, Error>(&aligned_bytes).map_err(|e| {
                    ArpeggioError::invalid_format(
                        "model",
                        format!(
                            "validation failed; the model file may be corrupted or incompatible: {e}"
                        ),
                    )
                })?;
                validate_header(archived)?;

                let data: &'static ArchivedModelInner = unsafe { &*(archived as *const _) };
                Ok(Self::Archived(ArchivedModel {
                    _buffer: ModelBuffer::Aligned(aligned_bytes),
                    data,
                }))
            }
        }
    }

    /// Loads a model from a file path without archive validation.
    ///
    /// Header validation (magic and order bounds) still runs, but the
    /// structural integrity of the archived data is taken on trust,
    /// which makes loading constant-time even for the first access.
    ///
    /// # Errors
    ///
    /// Returns a format error when the magic line or header is wrong.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the file is a valid, uncorrupted model
    /// produced by this crate version; a truncated or tampered file can
    /// make subsequent queries read out of bounds or report undefined
    /// values.
    pub unsafe fn from_path_unchecked<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            ArpeggioError::invalid_config("path", format!("failed to open the model file: {e}"))
        })?;
        let mut magic = [0u8; MODEL_MAGIC_LEN];
        file.read_exact(&mut magic)?;
        if magic != *MODEL_MAGIC {
            return Err(ArpeggioError::invalid_format(
                "model",
                "the magic bytes of the input model mismatch; not an arpeggio model or an incompatible format version",
            ));
        }

        let mmap = unsafe { Mmap::map(&file)? };
        let Some(data_bytes) = mmap.get(DATA_START..) else {
            return Err(ArpeggioError::invalid_format(
                "model",
                "model file too small or truncated",
            ));
        };

        let archived = unsafe { access_unchecked::<ArchivedModelInner>(data_bytes) };
        validate_header(archived)?;
        let data: &'static ArchivedModelInner = unsafe { &*(archived as *const _) };
        Ok(Self::Archived(ArchivedModel {
            _buffer: ModelBuffer::Mmap(mmap),
            data,
        }))
    }

    /// Loads a model from a Zstandard-compressed model file,
    /// decompressing into an aligned heap buffer.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened, is not a valid
    /// Zstandard stream, or the decompressed contents fail the checks of
    /// [`read`](Self::read).
    pub fn from_zstd<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path.as_ref()).map_err(|e| {
            ArpeggioError::invalid_config("path", format!("failed to open the model file: {e}"))
        })?;
        Self::read(zstd::Decoder::new(file)?)
    }

    /// The maximum n-gram order of the model.
    pub fn order(&self) -> usize {
        match self {
            Self::Archived(m) => m.data.order(),
            Self::Owned(inner) => inner.order(),
        }
    }

    /// The per-order record counts declared by the source text model.
    pub fn counts(&self) -> Vec<u64> {
        match self {
            Self::Archived(m) => m.data.counts.iter().map(|c| c.to_native()).collect(),
            Self::Owned(inner) => inner.counts.clone(),
        }
    }

    /// Which storage backend this model was built with.
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Archived(m) => m.data.search().backend_kind(),
            Self::Owned(inner) => inner.search().backend_kind(),
        }
    }

    /// Whether `word` is in the vocabulary. Reserved tokens are always
    /// present.
    pub fn contains(&self, word: &str) -> bool {
        match self {
            Self::Archived(m) => m.data.vocab().contains(word),
            Self::Owned(inner) => inner.vocab().contains(word),
        }
    }

    /// Resolves `word` to its id; unseen words map to the unknown id.
    pub fn lookup_word(&self, word: &str) -> WordId {
        match self {
            Self::Archived(m) => m.data.vocab().lookup(word),
            Self::Owned(inner) => inner.vocab().lookup(word),
        }
    }

    /// Number of word ids, reserved ids included.
    pub fn vocab_len(&self) -> usize {
        match self {
            Self::Archived(m) => m.data.vocab().len(),
            Self::Owned(inner) => inner.vocab().len(),
        }
    }

    #[inline(always)]
    pub(crate) fn inner(&self) -> ModelInnerRef<'_> {
        match self {
            Self::Archived(m) => ModelInnerRef::Archived(m.data),
            Self::Owned(inner) => ModelInnerRef::Owned(inner),
        }
    }
}

/// Header checks shared by every load path. Fails closed: an order or
/// level structure this build cannot represent is an error, never a
/// best-effort reinterpretation.
fn validate_header(data: &ArchivedModelInner) -> Result<()> {
    let order = data.order();
    if order < 2 {
        return Err(ArpeggioError::invalid_format(
            "model",
            format!("header order {order} is below the minimum of 2"),
        ));
    }
    if order > MAX_ORDER {
        return Err(ArpeggioError::invalid_format(
            "model",
            format!("header order {order} exceeds the compiled maximum {MAX_ORDER}"),
        ));
    }
    let num_middles = data.search().num_middles();
    if num_middles != order - 2 {
        return Err(ArpeggioError::invalid_format(
            "model",
            format!(
                "level structure mismatch: order {order} with {num_middles} middle level(s)"
            ),
        ));
    }
    if data.vocab().len() < RESERVED_WORDS {
        return Err(ArpeggioError::invalid_format(
            "model",
            "vocabulary is missing the reserved tokens",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const BIGRAM_ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=3

\\1-grams:
-1.2\t<unk>
-0.8\t<s>\t-0.4
-0.9\t</s>
-0.6\tlanguage\t-0.3
-0.7\tmodeling\t-0.2

\\2-grams:
-0.3\t<s> language
-0.4\tlanguage modeling
-0.5\tmodeling </s>

\\end\\
";

    fn build_inner(config: &Config) -> ModelInner {
        ModelBuilder::from_arpa_reader(BIGRAM_ARPA.as_bytes(), config).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let inner = build_inner(&Config::default());
        let mut buffer = Vec::new();
        inner.write(&mut buffer).unwrap();

        let model = Model::read(buffer.as_slice()).unwrap();
        assert_eq!(model.order(), 2);
        assert_eq!(model.counts(), vec![5, 3]);
        assert_eq!(model.backend_kind(), BackendKind::Probing);
        assert!(model.contains("language"));
        assert!(model.contains("<s>"));
        assert!(!model.contains("fun"));
        assert_eq!(model.vocab_len(), 5);
    }

    #[test]
    fn test_from_path_mmap_roundtrip() {
        let config = Config {
            backend: BackendKind::Trie,
            ..Config::default()
        };
        let inner = build_inner(&config);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        inner.write(&mut file).unwrap();
        file.flush().unwrap();

        let model = Model::from_path(file.path()).unwrap();
        assert_eq!(model.order(), 2);
        assert_eq!(model.backend_kind(), BackendKind::Trie);
        assert!(model.contains("modeling"));

        let model = unsafe { Model::from_path_unchecked(file.path()) }.unwrap();
        assert_eq!(model.order(), 2);
    }

    #[test]
    fn test_from_zstd_roundtrip() {
        let inner = build_inner(&Config::default());
        let mut buffer = Vec::new();
        inner.write(&mut buffer).unwrap();
        let compressed = zstd::encode_all(buffer.as_slice(), 3).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&compressed).unwrap();
        file.flush().unwrap();

        let model = Model::from_zstd(file.path()).unwrap();
        assert_eq!(model.order(), 2);
        assert!(model.contains("language"));
    }

    #[test]
    fn test_magic_mismatch_is_format_error() {
        let err = Model::read(&b"NotAnArpeggioModelFile 9.9\x00\x00\x00\x00\x00\x00"[..])
            .unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
    }

    #[test]
    fn test_header_order_above_maximum_rejected_at_load() {
        // Hand-assemble an inner whose header declares an order this
        // build cannot represent; the load must fail closed.
        let inner = build_inner(&Config::default());
        let oversized = ModelInner::new(vec![1; MAX_ORDER + 1], inner.vocab, inner.search);

        let mut buffer = Vec::new();
        oversized.write(&mut buffer).unwrap();
        let err = Model::read(buffer.as_slice()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let inner = build_inner(&Config::default());
        let mut buffer = Vec::new();
        inner.write(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 8);
        let err = Model::read(buffer.as_slice()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
    }
}
