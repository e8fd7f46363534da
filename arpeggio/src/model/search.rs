//! The storage-backend contract and its two implementations.

pub(crate) mod probing;
pub(crate) mod trie;

use rkyv::{Archive, Deserialize, Serialize};

use crate::common::WordId;
use crate::model::config::BackendKind;
use crate::model::search::probing::ProbingSearch;
use crate::model::search::trie::TrieSearch;

/// The abstract lookup contract both backends satisfy, in the traversal
/// order of scoring: unigram first, then one middle level per order, then
/// the maximum-order level. `Node` carries the backend's notion of "where
/// the matched path can continue" (a chained hash, or a child range).
pub(crate) trait SearchLookup {
    /// Backend-specific continuation token for a partially matched path.
    type Node: Copy;

    /// Unigram lookup; always succeeds. Returns probability, backoff, and
    /// the continuation node for two-word lookups.
    fn lookup_unigram(&self, word: WordId) -> (f32, f32, Self::Node);

    /// Number of middle levels (model order minus two).
    fn num_middles(&self) -> usize;

    /// Extends the matched path by one history word at the given middle
    /// level, updating `node` on success.
    fn lookup_middle(&self, level: usize, word: WordId, node: &mut Self::Node)
    -> Option<(f32, f32)>;

    /// Extends the matched path to the maximum order.
    fn lookup_longest(&self, word: WordId, node: Self::Node) -> Option<f32>;
}

/// Tagged union over the two storage backends. The active variant is
/// recorded in the model file and reconstructed on load without caller
/// involvement.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) enum SearchWrapper {
    Probing(ProbingSearch),
    Trie(TrieSearch),
}

impl SearchWrapper {
    pub(crate) fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Probing(_) => BackendKind::Probing,
            Self::Trie(_) => BackendKind::Trie,
        }
    }

    pub(crate) fn num_middles(&self) -> usize {
        match self {
            Self::Probing(s) => s.num_middles(),
            Self::Trie(s) => s.num_middles(),
        }
    }
}

impl ArchivedSearchWrapper {
    pub(crate) fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Probing(_) => BackendKind::Probing,
            Self::Trie(_) => BackendKind::Trie,
        }
    }

    pub(crate) fn num_middles(&self) -> usize {
        match self {
            Self::Probing(s) => s.num_middles(),
            Self::Trie(s) => s.num_middles(),
        }
    }
}
