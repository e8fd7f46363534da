//! Sorted trie storage backend.
//!
//! N-grams are stored reversed (predicted word first), so the longest
//! matching suffix of a query is a single root-to-leaf descent: the dense
//! unigram level yields a child range in the first middle level, each
//! middle level is binary-searched for the next history word inside the
//! parent's range, and the final level stores probabilities only.
//!
//! Middle and longest levels are bit-packed record arrays. Child pointers
//! are compressed to the single global width needed for the next level's
//! length; values are raw 32-bit floats or codebook indices when the
//! model is quantized. Each middle level carries one sentinel record so
//! that entry `i`'s child range is read as `[next(i), next(i + 1))`.

use rkyv::{Archive, Deserialize, Serialize};

use crate::bits::{read_bits_with, words_for_bits, write_bits};
use crate::common::WordId;
use crate::model::quantize::QuantTables;
use crate::model::search::SearchLookup;

/// Contiguous index range of one node's children in the next level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct NodeRange {
    pub(crate) begin: u64,
    pub(crate) end: u64,
}

/// Dense first level: probability, backoff, and child-range start per
/// word id. `next` has one extra entry so ranges close.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct TrieUnigram {
    probs: Vec<f32>,
    backoffs: Vec<f32>,
    next: Vec<u64>,
}

impl TrieUnigram {
    pub(crate) fn new(probs: Vec<f32>, backoffs: Vec<f32>, next: Vec<u64>) -> Self {
        debug_assert_eq!(probs.len() + 1, next.len());
        Self {
            probs,
            backoffs,
            next,
        }
    }

    #[inline(always)]
    pub(crate) fn find(&self, word: WordId) -> (f32, f32, NodeRange) {
        let w = word as usize;
        (
            self.probs[w],
            self.backoffs[w],
            NodeRange {
                begin: self.next[w],
                end: self.next[w + 1],
            },
        )
    }
}

impl ArchivedTrieUnigram {
    #[inline(always)]
    pub(crate) fn find(&self, word: WordId) -> (f32, f32, NodeRange) {
        let w = word as usize;
        (
            self.probs[w].to_native(),
            self.backoffs[w].to_native(),
            NodeRange {
                begin: self.next[w].to_native(),
                end: self.next[w + 1].to_native(),
            },
        )
    }
}

/// Binary search for `word` over the word field of packed records in
/// `[range.begin, range.end)`.
#[inline(always)]
fn lower_bound_word<F>(
    word_at: F,
    total_bits: u8,
    word_bits: u8,
    word: WordId,
    range: NodeRange,
) -> Option<u64>
where
    F: Fn(usize) -> u64 + Copy,
{
    let (mut lo, mut hi) = (range.begin, range.end);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let candidate = read_bits_with(word_at, mid * u64::from(total_bits), word_bits) as WordId;
        if candidate < word {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == range.end {
        return None;
    }
    let candidate = read_bits_with(word_at, lo * u64::from(total_bits), word_bits) as WordId;
    (candidate == word).then_some(lo)
}

/// One bit-packed middle level: records `[word | prob | backoff | next]`.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct TrieMiddle {
    word_bits: u8,
    prob_bits: u8,
    backoff_bits: u8,
    ptr_bits: u8,
    total_bits: u8,
    count: u64,
    data: Vec<u64>,
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn middle_find_with<F>(
    word_at: F,
    word_bits: u8,
    prob_bits: u8,
    backoff_bits: u8,
    ptr_bits: u8,
    total_bits: u8,
    word: WordId,
    range: NodeRange,
) -> Option<(u64, u64, NodeRange)>
where
    F: Fn(usize) -> u64 + Copy,
{
    let idx = lower_bound_word(word_at, total_bits, word_bits, word, range)?;
    let base = idx * u64::from(total_bits);
    let prob = read_bits_with(word_at, base + u64::from(word_bits), prob_bits);
    let backoff = read_bits_with(
        word_at,
        base + u64::from(word_bits) + u64::from(prob_bits),
        backoff_bits,
    );
    let ptr_offset = u64::from(word_bits) + u64::from(prob_bits) + u64::from(backoff_bits);
    let begin = read_bits_with(word_at, base + ptr_offset, ptr_bits);
    let end = read_bits_with(
        word_at,
        (idx + 1) * u64::from(total_bits) + ptr_offset,
        ptr_bits,
    );
    Some((prob, backoff, NodeRange { begin, end }))
}

impl TrieMiddle {
    #[inline(always)]
    pub(crate) fn find(&self, word: WordId, range: NodeRange) -> Option<(u64, u64, NodeRange)> {
        middle_find_with(
            |i| self.data[i],
            self.word_bits,
            self.prob_bits,
            self.backoff_bits,
            self.ptr_bits,
            self.total_bits,
            word,
            range,
        )
    }
}

impl ArchivedTrieMiddle {
    #[inline(always)]
    pub(crate) fn find(&self, word: WordId, range: NodeRange) -> Option<(u64, u64, NodeRange)> {
        middle_find_with(
            |i| self.data[i].to_native(),
            self.word_bits,
            self.prob_bits,
            self.backoff_bits,
            self.ptr_bits,
            self.total_bits,
            word,
            range,
        )
    }
}

/// Incremental writer for a middle level. Records must be pushed in
/// sorted order; `finish` writes the sentinel that closes the last range.
pub(crate) struct MiddleBuilder {
    word_bits: u8,
    prob_bits: u8,
    backoff_bits: u8,
    ptr_bits: u8,
    total_bits: u8,
    count: u64,
    index: u64,
    data: Vec<u64>,
}

impl MiddleBuilder {
    pub(crate) fn new(count: u64, word_bits: u8, prob_bits: u8, backoff_bits: u8, ptr_bits: u8) -> Self {
        let total_bits = word_bits + prob_bits + backoff_bits + ptr_bits;
        let data = vec![0u64; words_for_bits((count + 1) * u64::from(total_bits))];
        Self {
            word_bits,
            prob_bits,
            backoff_bits,
            ptr_bits,
            total_bits,
            count,
            index: 0,
            data,
        }
    }

    pub(crate) fn push(&mut self, word: WordId, prob_code: u64, backoff_code: u64, next_begin: u64) {
        debug_assert!(self.index < self.count);
        let base = self.index * u64::from(self.total_bits);
        write_bits(&mut self.data, base, self.word_bits, u64::from(word));
        write_bits(
            &mut self.data,
            base + u64::from(self.word_bits),
            self.prob_bits,
            prob_code,
        );
        write_bits(
            &mut self.data,
            base + u64::from(self.word_bits) + u64::from(self.prob_bits),
            self.backoff_bits,
            backoff_code,
        );
        write_bits(
            &mut self.data,
            base + u64::from(self.word_bits) + u64::from(self.prob_bits) + u64::from(self.backoff_bits),
            self.ptr_bits,
            next_begin,
        );
        self.index += 1;
    }

    pub(crate) fn finish(mut self, next_end: u64) -> TrieMiddle {
        debug_assert_eq!(self.index, self.count);
        let base = self.count * u64::from(self.total_bits);
        write_bits(
            &mut self.data,
            base + u64::from(self.word_bits) + u64::from(self.prob_bits) + u64::from(self.backoff_bits),
            self.ptr_bits,
            next_end,
        );
        TrieMiddle {
            word_bits: self.word_bits,
            prob_bits: self.prob_bits,
            backoff_bits: self.backoff_bits,
            ptr_bits: self.ptr_bits,
            total_bits: self.total_bits,
            count: self.count,
            data: self.data,
        }
    }
}

/// The maximum-order level: records `[word | prob]`.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct TrieLongest {
    word_bits: u8,
    prob_bits: u8,
    total_bits: u8,
    count: u64,
    data: Vec<u64>,
}

impl TrieLongest {
    #[inline(always)]
    pub(crate) fn find(&self, word: WordId, range: NodeRange) -> Option<u64> {
        let idx = lower_bound_word(|i| self.data[i], self.total_bits, self.word_bits, word, range)?;
        Some(read_bits_with(
            |i| self.data[i],
            idx * u64::from(self.total_bits) + u64::from(self.word_bits),
            self.prob_bits,
        ))
    }
}

impl ArchivedTrieLongest {
    #[inline(always)]
    pub(crate) fn find(&self, word: WordId, range: NodeRange) -> Option<u64> {
        let word_at = |i: usize| self.data[i].to_native();
        let idx = lower_bound_word(word_at, self.total_bits, self.word_bits, word, range)?;
        Some(read_bits_with(
            word_at,
            idx * u64::from(self.total_bits) + u64::from(self.word_bits),
            self.prob_bits,
        ))
    }
}

/// Incremental writer for the longest level.
pub(crate) struct LongestBuilder {
    word_bits: u8,
    prob_bits: u8,
    total_bits: u8,
    count: u64,
    index: u64,
    data: Vec<u64>,
}

impl LongestBuilder {
    pub(crate) fn new(count: u64, word_bits: u8, prob_bits: u8) -> Self {
        let total_bits = word_bits + prob_bits;
        let data = vec![0u64; words_for_bits(count.max(1) * u64::from(total_bits))];
        Self {
            word_bits,
            prob_bits,
            total_bits,
            count,
            index: 0,
            data,
        }
    }

    pub(crate) fn push(&mut self, word: WordId, prob_code: u64) {
        debug_assert!(self.index < self.count);
        let base = self.index * u64::from(self.total_bits);
        write_bits(&mut self.data, base, self.word_bits, u64::from(word));
        write_bits(
            &mut self.data,
            base + u64::from(self.word_bits),
            self.prob_bits,
            prob_code,
        );
        self.index += 1;
    }

    pub(crate) fn finish(self) -> TrieLongest {
        debug_assert_eq!(self.index, self.count);
        TrieLongest {
            word_bits: self.word_bits,
            prob_bits: self.prob_bits,
            total_bits: self.total_bits,
            count: self.count,
            data: self.data,
        }
    }
}

/// The complete trie backend for one model.
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct TrieSearch {
    unigram: TrieUnigram,
    middles: Vec<TrieMiddle>,
    longest: TrieLongest,
    quant: Option<QuantTables>,
}

impl TrieSearch {
    pub(crate) fn new(
        unigram: TrieUnigram,
        middles: Vec<TrieMiddle>,
        longest: TrieLongest,
        quant: Option<QuantTables>,
    ) -> Self {
        Self {
            unigram,
            middles,
            longest,
            quant,
        }
    }

    pub(crate) fn num_middles(&self) -> usize {
        self.middles.len()
    }
}

impl ArchivedTrieSearch {
    pub(crate) fn num_middles(&self) -> usize {
        self.middles.len()
    }
}

impl SearchLookup for TrieSearch {
    type Node = NodeRange;

    #[inline(always)]
    fn lookup_unigram(&self, word: WordId) -> (f32, f32, NodeRange) {
        self.unigram.find(word)
    }

    #[inline(always)]
    fn num_middles(&self) -> usize {
        self.middles.len()
    }

    #[inline(always)]
    fn lookup_middle(&self, level: usize, word: WordId, node: &mut NodeRange) -> Option<(f32, f32)> {
        let (prob_code, backoff_code, next) = self.middles[level].find(word, *node)?;
        *node = next;
        Some(match &self.quant {
            Some(tables) => tables.decode_middle(level, prob_code, backoff_code),
            None => (
                f32::from_bits(prob_code as u32),
                f32::from_bits(backoff_code as u32),
            ),
        })
    }

    #[inline(always)]
    fn lookup_longest(&self, word: WordId, node: NodeRange) -> Option<f32> {
        let prob_code = self.longest.find(word, node)?;
        Some(match &self.quant {
            Some(tables) => tables.decode_longest(prob_code),
            None => f32::from_bits(prob_code as u32),
        })
    }
}

impl SearchLookup for ArchivedTrieSearch {
    type Node = NodeRange;

    #[inline(always)]
    fn lookup_unigram(&self, word: WordId) -> (f32, f32, NodeRange) {
        self.unigram.find(word)
    }

    #[inline(always)]
    fn num_middles(&self) -> usize {
        self.middles.len()
    }

    #[inline(always)]
    fn lookup_middle(&self, level: usize, word: WordId, node: &mut NodeRange) -> Option<(f32, f32)> {
        let (prob_code, backoff_code, next) = self.middles[level].find(word, *node)?;
        *node = next;
        Some(match self.quant.as_ref() {
            Some(tables) => tables.decode_middle(level, prob_code, backoff_code),
            None => (
                f32::from_bits(prob_code as u32),
                f32::from_bits(backoff_code as u32),
            ),
        })
    }

    #[inline(always)]
    fn lookup_longest(&self, word: WordId, node: NodeRange) -> Option<f32> {
        let prob_code = self.longest.find(word, node)?;
        Some(match self.quant.as_ref() {
            Some(tables) => tables.decode_longest(prob_code),
            None => f32::from_bits(prob_code as u32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unigram_ranges() {
        let unigram = TrieUnigram::new(
            vec![-1.0, -0.5, -0.25],
            vec![0.0, -0.1, 0.0],
            vec![0, 0, 2, 3],
        );
        let (prob, backoff, range) = unigram.find(1);
        assert_eq!(prob, -0.5);
        assert_eq!(backoff, -0.1);
        assert_eq!(range, NodeRange { begin: 0, end: 2 });
        let (_, _, range) = unigram.find(0);
        assert_eq!(range, NodeRange { begin: 0, end: 0 });
    }

    #[test]
    fn test_middle_find_and_ranges() {
        // Two records: (word 2, children [0, 3)) and (word 5, children
        // [3, 4)); sentinel closes the last range at 4.
        let mut builder = MiddleBuilder::new(2, 4, 32, 32, 3);
        builder.push(2, u64::from((-0.5f32).to_bits()), u64::from((-0.1f32).to_bits()), 0);
        builder.push(5, u64::from((-0.75f32).to_bits()), u64::from(0.0f32.to_bits()), 3);
        let middle = builder.finish(4);

        let range = NodeRange { begin: 0, end: 2 };
        let (prob, backoff, children) = middle.find(2, range).unwrap();
        assert_eq!(f32::from_bits(prob as u32), -0.5);
        assert_eq!(f32::from_bits(backoff as u32), -0.1);
        assert_eq!(children, NodeRange { begin: 0, end: 3 });

        let (_, _, children) = middle.find(5, range).unwrap();
        assert_eq!(children, NodeRange { begin: 3, end: 4 });

        assert!(middle.find(3, range).is_none());
        assert!(middle.find(2, NodeRange { begin: 1, end: 2 }).is_none());
    }

    #[test]
    fn test_longest_find() {
        let mut builder = LongestBuilder::new(3, 4, 32);
        builder.push(1, u64::from((-0.25f32).to_bits()));
        builder.push(4, u64::from((-0.5f32).to_bits()));
        builder.push(9, u64::from((-0.75f32).to_bits()));
        let longest = builder.finish();

        let range = NodeRange { begin: 0, end: 3 };
        let prob = longest.find(4, range).unwrap();
        assert_eq!(f32::from_bits(prob as u32), -0.5);
        assert!(longest.find(2, range).is_none());
        assert!(longest.find(9, NodeRange { begin: 0, end: 2 }).is_none());
    }
}
