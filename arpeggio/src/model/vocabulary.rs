//! Word interning and membership lookup.
//!
//! The frozen vocabulary stores sorted `(hash, id)` pairs rather than the
//! word strings themselves: queries only ever need membership and id
//! resolution, and hashes keep the model file small and its lookup
//! branch-free to archive. Ids are dense, assigned in order of first
//! appearance after the three reserved tokens.

use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};

use crate::common::{
    BOS_ID, BOS_WORD, EOS_ID, EOS_WORD, RESERVED_WORDS, UNK_ID, UNK_WORD, UNK_WORD_CAP, WordId,
};
use crate::hash::hash_word;

/// Build-time interner. Assigns ids on first sight; reserved ids come
/// first and are stable across all models.
pub(crate) struct VocabularyBuilder {
    map: HashMap<u64, WordId>,
    len: u32,
}

impl VocabularyBuilder {
    pub(crate) fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(hash_word(UNK_WORD), UNK_ID);
        // Some toolkits emit the unknown token in caps.
        map.insert(hash_word(UNK_WORD_CAP), UNK_ID);
        map.insert(hash_word(BOS_WORD), BOS_ID);
        map.insert(hash_word(EOS_WORD), EOS_ID);
        Self {
            map,
            len: RESERVED_WORDS as u32,
        }
    }

    /// Interns `word`, assigning the next dense id on first sight.
    pub(crate) fn intern(&mut self, word: &str) -> WordId {
        match self.map.entry(hash_word(word)) {
            hashbrown::hash_map::Entry::Occupied(e) => *e.get(),
            hashbrown::hash_map::Entry::Vacant(e) => {
                let id = self.len;
                self.len += 1;
                *e.insert(id)
            }
        }
    }

    /// Resolves `word` without inserting; unseen words map to the unknown
    /// id.
    pub(crate) fn lookup(&self, word: &str) -> WordId {
        self.map.get(&hash_word(word)).copied().unwrap_or(UNK_ID)
    }

    /// Number of assigned ids, reserved ids included.
    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    pub(crate) fn freeze(self) -> Vocabulary {
        let mut pairs: Vec<(u64, WordId)> = self.map.into_iter().collect();
        pairs.sort_unstable_by_key(|&(h, _)| h);
        Vocabulary {
            hashes: pairs.iter().map(|&(h, _)| h).collect(),
            ids: pairs.iter().map(|&(_, id)| id).collect(),
            len: self.len,
        }
    }
}

/// Immutable word-to-id mapping, queried by hash with binary search.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct Vocabulary {
    hashes: Vec<u64>,
    ids: Vec<WordId>,
    len: u32,
}

impl Vocabulary {
    /// Resolves `word` to its id, or the unknown id when absent. Never
    /// fails and never inserts.
    #[inline(always)]
    pub(crate) fn lookup(&self, word: &str) -> WordId {
        let target = hash_word(word);
        let idx = self.hashes.partition_point(|&h| h < target);
        if idx < self.hashes.len() && self.hashes[idx] == target {
            self.ids[idx]
        } else {
            UNK_ID
        }
    }

    #[inline(always)]
    pub(crate) fn contains(&self, word: &str) -> bool {
        let target = hash_word(word);
        let idx = self.hashes.partition_point(|&h| h < target);
        idx < self.hashes.len() && self.hashes[idx] == target
    }

    /// Number of assigned ids, reserved ids included.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }
}

impl ArchivedVocabulary {
    #[inline(always)]
    pub(crate) fn lookup(&self, word: &str) -> WordId {
        let target = hash_word(word);
        let hashes = self.hashes.as_slice();
        let idx = hashes.partition_point(|h| h.to_native() < target);
        if idx < hashes.len() && hashes[idx].to_native() == target {
            self.ids[idx].to_native()
        } else {
            UNK_ID
        }
    }

    #[inline(always)]
    pub(crate) fn contains(&self, word: &str) -> bool {
        let target = hash_word(word);
        let hashes = self.hashes.as_slice();
        let idx = hashes.partition_point(|h| h.to_native() < target);
        idx < hashes.len() && hashes[idx].to_native() == target
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len.to_native() as usize
    }
}
