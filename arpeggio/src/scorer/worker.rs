//! Provider of a routine for sentence scoring.

use crate::common::{EOS_ID, UNK_ID, WordId};
use crate::errors::{ArpeggioError, Result};
use crate::scorer::{Scorer, WordScore};
use crate::state::State;

/// Provider of a routine for sentence scoring.
///
/// It holds the internal buffers used in scoring, which can be reused
/// across sentences to avoid unnecessary memory reallocation. Workers
/// are per-thread: the model is shared, the buffers are not.
pub struct Worker {
    scorer: Scorer,
    words: Vec<WordId>,
    oovs: Vec<bool>,
    scores: Vec<WordScore>,
    total: f32,
}

impl Worker {
    /// Creates a new instance.
    pub(crate) fn new(scorer: Scorer) -> Self {
        Self {
            scorer,
            words: vec![],
            oovs: vec![],
            scores: vec![],
            total: 0.0,
        }
    }

    /// Resets the input sentence to be scored, tokenizing on whitespace
    /// and resolving each token against the vocabulary.
    pub fn reset_sentence<S>(&mut self, input: S)
    where
        S: AsRef<str>,
    {
        self.words.clear();
        self.oovs.clear();
        self.scores.clear();
        self.total = 0.0;
        for token in input.as_ref().split_whitespace() {
            let id = self.scorer.model().lookup_word(token);
            self.words.push(id);
            self.oovs.push(id == UNK_ID);
        }
    }

    /// Scores the sentence set by [`reset_sentence`](Self::reset_sentence):
    /// every token in order, then the end-of-sentence token, starting
    /// from a begin-of-sentence context.
    ///
    /// # Errors
    ///
    /// Returns a query error when no tokens were set.
    pub fn score(&mut self) -> Result<()> {
        self.scores.clear();
        self.total = 0.0;
        if self.words.is_empty() {
            return Err(ArpeggioError::invalid_query(
                "nothing to score: the sentence has no tokens",
            ));
        }
        let mut state = self.scorer.begin_sentence_state();
        let mut next = State::default();
        for i in 0..self.words.len() {
            let fs = self.scorer.full_score(&state, self.words[i], &mut next);
            self.scores.push(WordScore {
                prob: fs.prob,
                ngram_length: fs.ngram_length,
                oov: self.oovs[i],
            });
            self.total += fs.prob;
            state = next;
        }
        let fs = self.scorer.full_score(&state, EOS_ID, &mut next);
        self.scores.push(WordScore {
            prob: fs.prob,
            ngram_length: fs.ngram_length,
            oov: false,
        });
        self.total += fs.prob;
        Ok(())
    }

    /// Gets the number of scored entries, the end-of-sentence token
    /// included.
    #[inline(always)]
    pub fn num_scores(&self) -> usize {
        self.scores.len()
    }

    /// Gets the `i`-th scored entry.
    #[inline(always)]
    pub fn word_score(&self, i: usize) -> WordScore {
        self.scores[i]
    }

    /// All scored entries in sentence order; the last one is the
    /// end-of-sentence token.
    #[inline(always)]
    pub fn word_scores(&self) -> &[WordScore] {
        &self.scores
    }

    /// Total log10 probability of the last scored sentence.
    #[inline(always)]
    pub fn total(&self) -> f32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Config, Model, ModelBuilder};

    const BIGRAM_ARPA: &str = "\
\\data\\
ngram 1=4
ngram 2=3

\\1-grams:
-1.1\t<unk>
-0.8\t<s>\t-0.4
-0.9\t</s>
-0.6\twaltz\t-0.3

\\2-grams:
-0.3\t<s> waltz
-0.5\twaltz </s>
-0.7\twaltz waltz

\\end\\
";

    fn build_worker() -> Worker {
        let inner =
            ModelBuilder::from_arpa_reader(BIGRAM_ARPA.as_bytes(), &Config::default()).unwrap();
        Scorer::new(Model::from_inner(inner)).new_worker()
    }

    #[test]
    fn test_score_and_accessors() {
        let mut worker = build_worker();
        worker.reset_sentence("waltz waltz");
        worker.score().unwrap();
        assert_eq!(worker.num_scores(), 3);
        // p(waltz|<s>) = -0.3, p(waltz|waltz) = -0.7, p(</s>|waltz) = -0.5.
        assert!((worker.word_score(0).prob - -0.3).abs() < 1e-5);
        assert!((worker.word_score(1).prob - -0.7).abs() < 1e-5);
        assert!((worker.word_score(2).prob - -0.5).abs() < 1e-5);
        assert!((worker.total() - -1.5).abs() < 1e-5);
    }

    #[test]
    fn test_worker_reuse_resets_results() {
        let mut worker = build_worker();
        worker.reset_sentence("waltz waltz waltz");
        worker.score().unwrap();
        let first = worker.total();
        worker.reset_sentence("waltz");
        worker.score().unwrap();
        assert_eq!(worker.num_scores(), 2);
        assert!((worker.total() - -0.8).abs() < 1e-5);
        assert_ne!(worker.total(), first);
    }

    #[test]
    fn test_oov_flagging() {
        let mut worker = build_worker();
        worker.reset_sentence("tango waltz");
        worker.score().unwrap();
        assert!(worker.word_score(0).oov);
        assert!(!worker.word_score(1).oov);
    }
}
