//! Hash-probing storage backend.
//!
//! Each order above one is an open-addressing table keyed by the chained
//! hash of the reversed word-id sequence; unigrams are a dense array
//! indexed by id. Lookup is an expected O(1) probe sequence, bounded by
//! the configured probe limit. There is no ordering across entries, and
//! the load-factor headroom costs more memory than the trie backend.

use rkyv::{Archive, Deserialize, Serialize};

use crate::common::WordId;
use crate::errors::{ArpeggioError, Result};
use crate::hash::combine_word_hash;
use crate::model::search::SearchLookup;

/// Marker for an unoccupied slot. A real chained hash of 0 would collide
/// with it; over 64 bits this does not occur in practice.
const EMPTY_KEY: u64 = 0;

fn bucket_count(entries: u64, multiplier: f32) -> usize {
    ((entries as f64 * f64::from(multiplier)).ceil() as usize).max(1)
}

fn probe_find_with<F>(key_at: F, buckets: usize, max_probes: u32, key: u64) -> Option<usize>
where
    F: Fn(usize) -> u64,
{
    let mut slot = (key % buckets as u64) as usize;
    for _ in 0..=max_probes {
        let occupant = key_at(slot);
        if occupant == key {
            return Some(slot);
        }
        if occupant == EMPTY_KEY {
            return None;
        }
        slot += 1;
        if slot == buckets {
            slot = 0;
        }
    }
    None
}

fn probe_insert(keys: &mut [u64], max_probes: u32, key: u64) -> Result<usize> {
    let buckets = keys.len();
    let mut slot = (key % buckets as u64) as usize;
    for _ in 0..=max_probes {
        if keys[slot] == EMPTY_KEY {
            keys[slot] = key;
            return Ok(slot);
        }
        slot += 1;
        if slot == buckets {
            slot = 0;
        }
    }
    Err(ArpeggioError::build_failed(
        "probing table",
        format!("probe bound {max_probes} exceeded during insertion; raise probing_multiplier"),
    ))
}

/// Table for one order below the maximum: probability and backoff per
/// entry.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct ProbingMiddle {
    keys: Vec<u64>,
    probs: Vec<f32>,
    backoffs: Vec<f32>,
    max_probes: u32,
}

impl ProbingMiddle {
    pub(crate) fn with_capacity(entries: u64, multiplier: f32, max_probes: u32) -> Self {
        let buckets = bucket_count(entries, multiplier);
        Self {
            keys: vec![EMPTY_KEY; buckets],
            probs: vec![0.0; buckets],
            backoffs: vec![0.0; buckets],
            max_probes,
        }
    }

    pub(crate) fn insert(&mut self, key: u64, prob: f32, backoff: f32) -> Result<()> {
        let slot = probe_insert(&mut self.keys, self.max_probes, key)?;
        self.probs[slot] = prob;
        self.backoffs[slot] = backoff;
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn find(&self, key: u64) -> Option<(f32, f32)> {
        let slot = probe_find_with(|i| self.keys[i], self.keys.len(), self.max_probes, key)?;
        Some((self.probs[slot], self.backoffs[slot]))
    }
}

impl ArchivedProbingMiddle {
    #[inline(always)]
    pub(crate) fn find(&self, key: u64) -> Option<(f32, f32)> {
        let slot = probe_find_with(
            |i| self.keys[i].to_native(),
            self.keys.len(),
            self.max_probes.to_native(),
            key,
        )?;
        Some((self.probs[slot].to_native(), self.backoffs[slot].to_native()))
    }
}

/// Table for the maximum order: probability only.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct ProbingLongest {
    keys: Vec<u64>,
    probs: Vec<f32>,
    max_probes: u32,
}

impl ProbingLongest {
    pub(crate) fn with_capacity(entries: u64, multiplier: f32, max_probes: u32) -> Self {
        let buckets = bucket_count(entries, multiplier);
        Self {
            keys: vec![EMPTY_KEY; buckets],
            probs: vec![0.0; buckets],
            max_probes,
        }
    }

    pub(crate) fn insert(&mut self, key: u64, prob: f32) -> Result<()> {
        let slot = probe_insert(&mut self.keys, self.max_probes, key)?;
        self.probs[slot] = prob;
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn find(&self, key: u64) -> Option<f32> {
        let slot = probe_find_with(|i| self.keys[i], self.keys.len(), self.max_probes, key)?;
        Some(self.probs[slot])
    }
}

impl ArchivedProbingLongest {
    #[inline(always)]
    pub(crate) fn find(&self, key: u64) -> Option<f32> {
        let slot = probe_find_with(
            |i| self.keys[i].to_native(),
            self.keys.len(),
            self.max_probes.to_native(),
            key,
        )?;
        Some(self.probs[slot].to_native())
    }
}

/// The complete hash-probing backend for one model.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct ProbingSearch {
    unigram_probs: Vec<f32>,
    unigram_backoffs: Vec<f32>,
    middles: Vec<ProbingMiddle>,
    longest: ProbingLongest,
}

impl ProbingSearch {
    pub(crate) fn new(
        unigram_probs: Vec<f32>,
        unigram_backoffs: Vec<f32>,
        middles: Vec<ProbingMiddle>,
        longest: ProbingLongest,
    ) -> Self {
        Self {
            unigram_probs,
            unigram_backoffs,
            middles,
            longest,
        }
    }

    pub(crate) fn num_middles(&self) -> usize {
        self.middles.len()
    }
}

impl ArchivedProbingSearch {
    pub(crate) fn num_middles(&self) -> usize {
        self.middles.len()
    }
}

impl SearchLookup for ProbingSearch {
    type Node = u64;

    #[inline(always)]
    fn lookup_unigram(&self, word: WordId) -> (f32, f32, u64) {
        let w = word as usize;
        (self.unigram_probs[w], self.unigram_backoffs[w], u64::from(word))
    }

    #[inline(always)]
    fn num_middles(&self) -> usize {
        self.middles.len()
    }

    #[inline(always)]
    fn lookup_middle(&self, level: usize, word: WordId, node: &mut u64) -> Option<(f32, f32)> {
        *node = combine_word_hash(*node, word);
        self.middles[level].find(*node)
    }

    #[inline(always)]
    fn lookup_longest(&self, word: WordId, node: u64) -> Option<f32> {
        self.longest.find(combine_word_hash(node, word))
    }
}

impl SearchLookup for ArchivedProbingSearch {
    type Node = u64;

    #[inline(always)]
    fn lookup_unigram(&self, word: WordId) -> (f32, f32, u64) {
        let w = word as usize;
        (
            self.unigram_probs[w].to_native(),
            self.unigram_backoffs[w].to_native(),
            u64::from(word),
        )
    }

    #[inline(always)]
    fn num_middles(&self) -> usize {
        self.middles.len()
    }

    #[inline(always)]
    fn lookup_middle(&self, level: usize, word: WordId, node: &mut u64) -> Option<(f32, f32)> {
        *node = combine_word_hash(*node, word);
        self.middles[level].find(*node)
    }

    #[inline(always)]
    fn lookup_longest(&self, word: WordId, node: u64) -> Option<f32> {
        self.longest.find(combine_word_hash(node, word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut table = ProbingMiddle::with_capacity(4, 1.5, 16);
        table.insert(17, -0.5, -0.1).unwrap();
        table.insert(92, -0.25, 0.0).unwrap();
        assert_eq!(table.find(17), Some((-0.5, -0.1)));
        assert_eq!(table.find(92), Some((-0.25, 0.0)));
        assert_eq!(table.find(18), None);
    }

    #[test]
    fn test_colliding_keys_probe_forward() {
        // Capacity 6 = ceil(4 * 1.5); keys 7 and 13 both land on slot 1.
        let mut table = ProbingLongest::with_capacity(4, 1.5, 16);
        table.insert(7, -1.0).unwrap();
        table.insert(13, -2.0).unwrap();
        assert_eq!(table.find(7), Some(-1.0));
        assert_eq!(table.find(13), Some(-2.0));
    }

    #[test]
    fn test_probe_bound_exceeded_is_build_error() {
        let mut table = ProbingLongest::with_capacity(4, 1.5, 0);
        table.insert(7, -1.0).unwrap();
        let err = table.insert(13, -2.0).unwrap_err();
        assert!(matches!(err, ArpeggioError::Build(_)), "{err}");
    }

    #[test]
    fn test_wraparound_probing() {
        // Slot 5 of 6 occupied; the next insert wraps to slot 0.
        let mut table = ProbingLongest::with_capacity(4, 1.5, 16);
        table.insert(5, -1.0).unwrap();
        table.insert(11, -2.0).unwrap();
        assert_eq!(table.find(11), Some(-2.0));
    }
}
