//! Backoff scoring over a loaded model.
pub mod worker;

use std::sync::Arc;

use crate::common::{BOS_ID, UNK_ID, WordId};
use crate::errors::Result;
use crate::model::search::{ArchivedSearchWrapper, SearchLookup, SearchWrapper};
use crate::model::{Model, ModelInnerRef};
use crate::scorer::worker::Worker;
use crate::state::State;

/// Result of scoring one word in context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FullScore {
    /// Log10 probability of the word given the matched context.
    pub prob: f32,

    /// Length of the n-gram that was matched, the word included. Between
    /// 1 (unigram fallback) and the model order.
    pub ngram_length: u8,
}

/// Per-token entry reported by sentence scoring.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WordScore {
    /// Log10 probability of the token given its context.
    pub prob: f32,

    /// Length of the n-gram that was matched, the token included.
    pub ngram_length: u8,

    /// Whether the token was out of vocabulary and scored through the
    /// unknown-token unigram.
    pub oov: bool,
}

macro_rules! with_search {
    ($model:expr, $search:ident => $body:expr) => {
        match $model.inner() {
            ModelInnerRef::Archived(inner) => match inner.search() {
                ArchivedSearchWrapper::Probing($search) => $body,
                ArchivedSearchWrapper::Trie($search) => $body,
            },
            ModelInnerRef::Owned(inner) => match inner.search() {
                SearchWrapper::Probing($search) => $body,
                SearchWrapper::Trie($search) => $body,
            },
        }
    };
}

/// Scorer over one model.
///
/// Cheap to clone; clones share the model. For batch sentence scoring
/// create a [`Worker`] per thread; for incremental scoring thread a
/// [`State`] through [`full_score`](Self::full_score).
#[derive(Clone)]
pub struct Scorer {
    model: Arc<Model>,
}

impl Scorer {
    /// Creates a scorer, taking ownership of the model.
    ///
    /// To share one model among several scorers, use
    /// [`Scorer::from_shared_model`].
    pub fn new(model: Model) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    /// Creates a scorer from an already shared model.
    pub fn from_shared_model(model: Arc<Model>) -> Self {
        Self { model }
    }

    /// The underlying model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Creates a worker holding reusable sentence-scoring buffers.
    pub fn new_worker(&self) -> Worker {
        Worker::new(self.clone())
    }

    /// State for the start of a sentence: the begin token as context.
    pub fn begin_sentence_state(&self) -> State {
        let mut state = State::default();
        state.words[0] = BOS_ID;
        state.backoff[0] = with_search!(self.model, search => search.lookup_unigram(BOS_ID).1);
        state.length = 1;
        state
    }

    /// State carrying no context at all.
    pub fn null_context_state(&self) -> State {
        State::default()
    }

    /// Scores `word` following `in_state`'s context and writes the
    /// continuation context into `out_state`.
    ///
    /// This is the incremental API: keep the returned state and pass it
    /// back for the next word, so extending a sentence never rescans its
    /// prefix. Word ids outside the vocabulary resolve to the unknown
    /// token.
    pub fn full_score(&self, in_state: &State, word: WordId, out_state: &mut State) -> FullScore {
        let word = if (word as usize) < self.model.vocab_len() {
            word
        } else {
            UNK_ID
        };
        let order = self.model.order();
        with_search!(self.model, search => score_word(search, order, in_state, word, out_state))
    }

    /// Scores a whitespace-tokenized sentence, begin and end tokens
    /// included: the total log10 probability of `w1 .. wn </s>` given a
    /// begin-of-sentence context.
    ///
    /// # Errors
    ///
    /// Returns a query error when the sentence has no tokens.
    pub fn score(&self, sentence: &str) -> Result<f32> {
        let mut worker = self.new_worker();
        worker.reset_sentence(sentence);
        worker.score()?;
        Ok(worker.total())
    }

    /// Scores a sentence and reports each token's probability, matched
    /// n-gram length, and out-of-vocabulary flag. The final entry is the
    /// end-of-sentence token, so the probabilities sum to
    /// [`score`](Self::score).
    ///
    /// # Errors
    ///
    /// Returns a query error when the sentence has no tokens.
    pub fn full_scores(&self, sentence: &str) -> Result<Vec<WordScore>> {
        let mut worker = self.new_worker();
        worker.reset_sentence(sentence);
        worker.score()?;
        Ok(worker.word_scores().to_vec())
    }
}

/// The backoff algorithm, written once over the backend contract.
///
/// Searches in increasing n-gram length: the unigram always exists (the
/// unknown token backs unseen words), then each middle level extends the
/// match by one history word until a level has no matching child, then
/// the maximum-order level. Every in-state context longer than the
/// matched one contributes its backoff weight; a context stored without
/// an explicit weight contributed 0 at build time, an identity.
fn score_word<S>(
    search: &S,
    order: usize,
    in_state: &State,
    word: WordId,
    out_state: &mut State,
) -> FullScore
where
    S: SearchLookup,
{
    let (unigram_prob, unigram_backoff, mut node) = search.lookup_unigram(word);
    let mut prob = unigram_prob;
    let mut ngram_length = 1usize;
    out_state.words[0] = word;
    out_state.backoff[0] = unigram_backoff;

    let hist_len = usize::from(in_state.length).min(order - 1);
    let num_middles = search.num_middles();
    let mut i = 0usize;
    loop {
        if i == hist_len {
            // Ran out of history.
            break;
        }
        if i == num_middles {
            // Every middle level matched; only the longest level is left.
            if let Some(p) = search.lookup_longest(in_state.words[i], node) {
                prob = p;
                ngram_length = order;
            }
            break;
        }
        match search.lookup_middle(i, in_state.words[i], &mut node) {
            Some((p, b)) => {
                prob = p;
                ngram_length = i + 2;
                out_state.backoff[i + 1] = b;
                i += 1;
            }
            None => break,
        }
    }

    for j in (ngram_length - 1)..hist_len {
        prob += in_state.backoff[j];
    }

    out_state.length = ngram_length.min(order - 1) as u8;
    for j in 1..usize::from(out_state.length) {
        out_state.words[j] = in_state.words[j - 1];
    }

    FullScore {
        prob,
        ngram_length: ngram_length as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EOS_ID;
    use crate::errors::ArpeggioError;
    use crate::model::{BackendKind, Config, ModelBuilder, QuantConfig};

    const TRIGRAM_ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=4
ngram 3=2

\\1-grams:
-1.0\t<unk>
-0.8\t<s>\t-0.5
-0.7\t</s>
-0.4\tlanguage\t-0.3
-0.5\tmodeling\t-0.2

\\2-grams:
-0.2\t<s> language\t-0.1
-0.3\tlanguage modeling\t-0.15
-0.6\tmodeling </s>
-0.9\t<s> modeling

\\3-grams:
-0.1\t<s> language modeling
-0.25\tlanguage modeling </s>

\\end\\
";

    #[track_caller]
    fn build_scorer(config: &Config) -> Scorer {
        let inner = ModelBuilder::from_arpa_reader(TRIGRAM_ARPA.as_bytes(), config).unwrap();
        Scorer::new(Model::from_inner(inner))
    }

    fn all_backends() -> Vec<(&'static str, Scorer)> {
        vec![
            ("probing", build_scorer(&Config::default())),
            (
                "trie",
                build_scorer(&Config {
                    backend: BackendKind::Trie,
                    ..Config::default()
                }),
            ),
            (
                "trie+quant",
                build_scorer(&Config {
                    backend: BackendKind::Trie,
                    quant: Some(QuantConfig::default()),
                    ..Config::default()
                }),
            ),
        ]
    }

    #[test]
    fn test_fully_matched_sentence() {
        // p(language|<s>) = -0.2, p(modeling|<s> language) = -0.1,
        // p(</s>|language modeling) = -0.25.
        for (name, scorer) in all_backends() {
            let scores = scorer.full_scores("language modeling").unwrap();
            assert_eq!(scores.len(), 3, "{name}");
            assert!((scores[0].prob - -0.2).abs() < 1e-5, "{name}: {:?}", scores[0]);
            assert_eq!(scores[0].ngram_length, 2, "{name}");
            assert!((scores[1].prob - -0.1).abs() < 1e-5, "{name}: {:?}", scores[1]);
            assert_eq!(scores[1].ngram_length, 3, "{name}");
            assert!((scores[2].prob - -0.25).abs() < 1e-5, "{name}: {:?}", scores[2]);
            assert_eq!(scores[2].ngram_length, 3, "{name}");
            assert!(scores.iter().all(|s| !s.oov), "{name}");

            let total = scorer.score("language modeling").unwrap();
            assert!((total - -0.55).abs() < 1e-5, "{name}: {total}");
        }
    }

    #[test]
    fn test_implicit_zero_backoff_is_identity() {
        // "<s> modeling" stores no backoff; falling from the unmatched
        // trigram "<s> modeling </s>" to the bigram "modeling </s>" must
        // add nothing.
        for (name, scorer) in all_backends() {
            let total = scorer.score("modeling").unwrap();
            assert!((total - -1.5).abs() < 1e-5, "{name}: {total}");
        }
    }

    #[test]
    fn test_oov_word_backs_off_to_unknown_unigram() {
        // p(fun|<s>) = backoff(<s>) + p(<unk>) = -0.5 + -1.0;
        // p(</s>|fun) = p(</s>) = -0.7 (unknown has backoff 0).
        for (name, scorer) in all_backends() {
            assert!(!scorer.model().contains("fun"), "{name}");
            let scores = scorer.full_scores("fun").unwrap();
            assert_eq!(scores.len(), 2, "{name}");
            assert!(scores[0].oov, "{name}");
            assert_eq!(scores[0].ngram_length, 1, "{name}");
            assert!((scores[0].prob - -1.5).abs() < 1e-5, "{name}: {:?}", scores[0]);
            assert!(!scores[1].oov, "{name}");
            assert!((scores[1].prob - -0.7).abs() < 1e-5, "{name}: {:?}", scores[1]);
            let total = scorer.score("fun").unwrap();
            assert!((total - -2.2).abs() < 1e-5, "{name}: {total}");
        }
    }

    #[test]
    fn test_score_equals_sum_of_full_scores() {
        for (name, scorer) in all_backends() {
            for sentence in ["language modeling", "modeling language fun", "fun fun fun"] {
                let total = scorer.score(sentence).unwrap();
                let sum: f32 = scorer
                    .full_scores(sentence)
                    .unwrap()
                    .iter()
                    .map(|s| s.prob)
                    .sum();
                assert!((total - sum).abs() < 1e-3, "{name}: {sentence}: {total} vs {sum}");
            }
        }
    }

    #[test]
    fn test_backends_agree() {
        let backends = all_backends();
        let (_, reference) = &backends[0];
        for sentence in ["language modeling", "modeling", "fun language", "language language"] {
            let expected = reference.score(sentence).unwrap();
            for (name, scorer) in &backends[1..] {
                let got = scorer.score(sentence).unwrap();
                assert!((got - expected).abs() < 1e-4, "{name}: {sentence}: {got} vs {expected}");
            }
        }
    }

    #[test]
    fn test_matched_length_bounds() {
        for (_, scorer) in all_backends() {
            let order = scorer.model().order() as u8;
            let scores = scorer.full_scores("language modeling language fun modeling").unwrap();
            for (position, score) in scores.iter().enumerate() {
                assert!(score.ngram_length >= 1);
                assert!(score.ngram_length <= order);
                // No match can be longer than the tokens scored so far,
                // the begin token included.
                assert!(usize::from(score.ngram_length) <= position + 2);
            }
        }
    }

    #[test]
    fn test_incremental_state_threading_matches_batch() {
        for (name, scorer) in all_backends() {
            let mut state = scorer.begin_sentence_state();
            let mut next = State::default();
            let mut total = 0.0f32;
            for token in ["language", "modeling"] {
                let id = scorer.model().lookup_word(token);
                let fs = scorer.full_score(&state, id, &mut next);
                total += fs.prob;
                state = next;
            }
            total += scorer.full_score(&state, EOS_ID, &mut next).prob;
            let batch = scorer.score("language modeling").unwrap();
            assert!((total - batch).abs() < 1e-5, "{name}: {total} vs {batch}");
        }
    }

    #[test]
    fn test_null_context_scores_bare_unigram() {
        for (name, scorer) in all_backends() {
            let null = scorer.null_context_state();
            let mut out = State::default();
            let id = scorer.model().lookup_word("language");
            let fs = scorer.full_score(&null, id, &mut out);
            assert!((fs.prob - -0.4).abs() < 1e-5, "{name}: {:?}", fs);
            assert_eq!(fs.ngram_length, 1, "{name}");
            assert_eq!(out.len(), 1, "{name}");
        }
    }

    #[test]
    fn test_empty_sentence_is_query_error() {
        let scorer = build_scorer(&Config::default());
        for sentence in ["", "   \t  "] {
            let err = scorer.score(sentence).unwrap_err();
            assert!(matches!(err, ArpeggioError::Query(_)), "{err}");
        }
    }

    #[test]
    fn test_roundtrip_through_binary_preserves_scores() {
        for kind in [BackendKind::Probing, BackendKind::Trie] {
            let config = Config {
                backend: kind,
                ..Config::default()
            };
            let inner =
                ModelBuilder::from_arpa_reader(TRIGRAM_ARPA.as_bytes(), &config).unwrap();
            let built = Scorer::new(Model::from_inner(inner));
            let expected = built.score("language modeling fun").unwrap();

            let mut buffer = Vec::new();
            built.model().write(&mut buffer).unwrap();
            let loaded = Scorer::new(Model::read(buffer.as_slice()).unwrap());
            let got = loaded.score("language modeling fun").unwrap();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_out_of_range_word_id_falls_back_to_unknown() {
        let scorer = build_scorer(&Config::default());
        let null = scorer.null_context_state();
        let mut out = State::default();
        let fs = scorer.full_score(&null, 1_000_000, &mut out);
        assert!((fs.prob - -1.0).abs() < 1e-5, "{:?}", fs);
    }
}
