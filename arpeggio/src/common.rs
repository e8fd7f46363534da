//! Common settings in Arpeggio.

/// Identifier of a vocabulary word.
///
/// Word ids are dense and assigned in order of first appearance in the
/// unigram section of the text model, after the reserved ids below.
pub type WordId = u32;

/// The maximum n-gram order supported by this build.
///
/// The value bounds the size of [`State`](crate::state::State), which stores
/// `MAX_ORDER - 1` word ids and backoff weights inline. Raise it and
/// recompile if you need longer models.
pub const MAX_ORDER: usize = 6;

/// The fixed id of the unknown (out-of-vocabulary) token.
pub const UNK_ID: WordId = 0;

/// The fixed id of the sentence-begin token.
pub const BOS_ID: WordId = 1;

/// The fixed id of the sentence-end token.
pub const EOS_ID: WordId = 2;

/// Number of reserved word ids assigned before any model word.
pub const RESERVED_WORDS: usize = 3;

/// Spelling of the unknown token in text models.
pub const UNK_WORD: &str = "<unk>";

/// Alternative spelling of the unknown token found in some text models.
pub const UNK_WORD_CAP: &str = "<UNK>";

/// Spelling of the sentence-begin token in text models.
pub const BOS_WORD: &str = "<s>";

/// Spelling of the sentence-end token in text models.
pub const EOS_WORD: &str = "</s>";

/// Log10 probability assigned to a reserved token that the text model does
/// not provide a unigram for.
pub const HALLUCINATED_LOG_PROB: f32 = -100.0;
