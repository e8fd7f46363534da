//! Build pipeline from a text model to a [`ModelInner`].
//!
//! The pipeline streams the ARPA source once: unigrams intern the
//! vocabulary and fill the dense first level, then each higher order
//! either inserts straight into pre-sized probing tables or is staged,
//! sorted into reversed-lexicographic order, and assembled into trie
//! levels. Either way the input text is never materialized.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::arpa::ArpaReader;
use crate::bits::required_bits;
use crate::common::{
    BOS_WORD, EOS_WORD, HALLUCINATED_LOG_PROB, MAX_ORDER, RESERVED_WORDS, UNK_WORD, WordId,
};
use crate::errors::{ArpeggioError, Result};
use crate::hash::sequence_hash;
use crate::model::ModelInner;
use crate::model::config::{BackendKind, Config};
use crate::model::quantize::{QuantConfig, QuantTables};
use crate::model::search::SearchWrapper;
use crate::model::search::probing::{ProbingLongest, ProbingMiddle, ProbingSearch};
use crate::model::search::trie::{LongestBuilder, MiddleBuilder, TrieSearch, TrieUnigram};
use crate::model::vocabulary::VocabularyBuilder;

/// Builds models from text models in the ARPA format.
pub struct ModelBuilder;

impl ModelBuilder {
    /// Builds a [`ModelInner`] from an ARPA file on disk.
    ///
    /// # Errors
    ///
    /// See [`from_arpa_reader`](Self::from_arpa_reader).
    pub fn from_arpa_path<P>(path: P, config: &Config) -> Result<ModelInner>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path.as_ref()).map_err(|e| {
            ArpeggioError::invalid_config("path", format!("failed to open the text model: {e}"))
        })?;
        Self::from_arpa_reader(BufReader::new(file), config)
    }

    /// Builds a [`ModelInner`] by running the full pipeline over an ARPA
    /// source: vocabulary interning, value encoding, and backend
    /// construction per `config`.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid parameters, a format error for
    /// a malformed text model or an order outside 2..=[`MAX_ORDER`], and
    /// a build error when a construction invariant is violated (probe
    /// bound exceeded, model not suffix-closed). No partially built model
    /// is ever returned.
    pub fn from_arpa_reader<R>(rdr: R, config: &Config) -> Result<ModelInner>
    where
        R: BufRead,
    {
        config.validate()?;
        let mut arpa = ArpaReader::new(rdr)?;
        let counts = arpa.counts().to_vec();
        let order = counts.len();
        if order < 2 {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!("this engine assumes at least a bigram model; got order {order}"),
            ));
        }
        if order > MAX_ORDER {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!("model order {order} exceeds the compiled maximum {MAX_ORDER}"),
            ));
        }

        let mut vocab = VocabularyBuilder::new();
        let (uni_probs, uni_backoffs) = read_unigrams(&mut arpa, &mut vocab)?;
        let vocab_len = vocab.len();
        log::info!("interned {vocab_len} words from {} unigrams", counts[0]);

        let search = match config.backend {
            BackendKind::Probing => {
                let mut middles: Vec<ProbingMiddle> = counts[1..order - 1]
                    .iter()
                    .map(|&c| {
                        ProbingMiddle::with_capacity(c, config.probing_multiplier, config.max_probes)
                    })
                    .collect();
                let mut longest = ProbingLongest::with_capacity(
                    counts[order - 1],
                    config.probing_multiplier,
                    config.max_probes,
                );
                let mut ids: Vec<WordId> = Vec::with_capacity(order);
                for k in 2..=order {
                    arpa.read_ngram_header(k)?;
                    for _ in 0..counts[k - 1] {
                        let ng = arpa.next_ngram()?;
                        ids.clear();
                        for w in ng.words() {
                            ids.push(vocab.lookup(w));
                        }
                        let key = sequence_hash(&ids);
                        if k < order {
                            middles[k - 2].insert(key, ng.prob, ng.backoff.unwrap_or(0.0))?;
                        } else {
                            longest.insert(key, ng.prob)?;
                        }
                    }
                }
                SearchWrapper::Probing(ProbingSearch::new(
                    uni_probs,
                    uni_backoffs,
                    middles,
                    longest,
                ))
            }
            BackendKind::Trie => {
                let mut staged: Vec<StagedOrder> = (2..=order)
                    .map(|k| StagedOrder::new(k, counts[k - 1] as usize))
                    .collect();
                for k in 2..=order {
                    arpa.read_ngram_header(k)?;
                    let st = &mut staged[k - 2];
                    for _ in 0..counts[k - 1] {
                        let ng = arpa.next_ngram()?;
                        for w in ng.words() {
                            st.ids.push(vocab.lookup(w));
                        }
                        st.probs.push(ng.prob);
                        if k < order {
                            st.backoffs.push(ng.backoff.unwrap_or(0.0));
                        }
                    }
                }
                SearchWrapper::Trie(assemble_trie(
                    order,
                    staged,
                    uni_probs,
                    uni_backoffs,
                    vocab_len,
                    config.quant,
                )?)
            }
        };
        arpa.read_end()?;
        Ok(ModelInner::new(counts, vocab.freeze(), search))
    }
}

/// Reads the unigram section, interning words and filling the dense
/// first-level arrays. Reserved tokens missing from the text model are
/// hallucinated with [`HALLUCINATED_LOG_PROB`].
fn read_unigrams<R>(
    arpa: &mut ArpaReader<R>,
    vocab: &mut VocabularyBuilder,
) -> Result<(Vec<f32>, Vec<f32>)>
where
    R: BufRead,
{
    arpa.read_ngram_header(1)?;
    let declared = arpa.counts()[0];
    let mut probs = vec![HALLUCINATED_LOG_PROB; RESERVED_WORDS];
    let mut backoffs = vec![0.0f32; RESERVED_WORDS];
    let mut seen_reserved = [false; RESERVED_WORDS];
    for _ in 0..declared {
        let ng = arpa.next_ngram()?;
        let prob = ng.prob;
        let backoff = ng.backoff.unwrap_or(0.0);
        let Some(word) = ng.words().next() else {
            return Err(ArpeggioError::invalid_format("arpa", "empty unigram record"));
        };
        let id = vocab.intern(word) as usize;
        if id == probs.len() {
            probs.push(prob);
            backoffs.push(backoff);
        } else {
            probs[id] = prob;
            backoffs[id] = backoff;
            if id < RESERVED_WORDS {
                seen_reserved[id] = true;
            }
        }
    }
    for (id, seen) in seen_reserved.into_iter().enumerate() {
        if !seen {
            let name = [UNK_WORD, BOS_WORD, EOS_WORD][id];
            log::warn!(
                "{name} is missing from the unigram section; \
                 using probability {HALLUCINATED_LOG_PROB} with backoff 0"
            );
        }
    }
    Ok((probs, backoffs))
}

/// Records of one order staged for trie construction: flat word-id rows
/// with aligned probability and backoff columns.
struct StagedOrder {
    order: usize,
    ids: Vec<WordId>,
    probs: Vec<f32>,
    backoffs: Vec<f32>,
}

impl StagedOrder {
    fn new(order: usize, count: usize) -> Self {
        Self {
            order,
            ids: Vec::with_capacity(count * order),
            probs: Vec::with_capacity(count),
            backoffs: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.probs.len()
    }

    #[inline(always)]
    fn word(&self, record: usize, j: usize) -> WordId {
        self.ids[record * self.order + j]
    }
}

/// Sorts a level into reversed-lexicographic word-id order (the last word
/// is the most significant), the order trie levels are addressed in.
fn sort_level(st: &mut StagedOrder) {
    let k = st.order;
    let n = st.len();
    let mut perm: Vec<u32> = (0..n as u32).collect();
    let ids = &st.ids;
    perm.sort_unstable_by(|&a, &b| {
        let (a, b) = (a as usize * k, b as usize * k);
        for j in (0..k).rev() {
            match ids[a + j].cmp(&ids[b + j]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    });

    let mut new_ids = Vec::with_capacity(st.ids.len());
    let mut new_probs = Vec::with_capacity(n);
    let mut new_backoffs = Vec::with_capacity(st.backoffs.len());
    for &p in &perm {
        let p = p as usize;
        new_ids.extend_from_slice(&st.ids[p * k..(p + 1) * k]);
        new_probs.push(st.probs[p]);
        if !st.backoffs.is_empty() {
            new_backoffs.push(st.backoffs[p]);
        }
    }
    st.ids = new_ids;
    st.probs = new_probs;
    st.backoffs = new_backoffs;
}

/// Compares the trie-path prefix of a child record against a parent
/// record's full path. Both levels must already be sorted.
fn cmp_suffix(child: &StagedOrder, ci: usize, parent: &StagedOrder, pi: usize) -> Ordering {
    for j in 0..parent.order {
        let c = child.word(ci, child.order - 1 - j);
        let p = parent.word(pi, parent.order - 1 - j);
        match c.cmp(&p) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Child-range starts for every parent record, plus a closing entry.
///
/// Since both levels are sorted, one merge scan attaches each child run
/// to its parent. A child whose parent record does not exist means the
/// model is not suffix-closed, which the trie cannot represent.
fn scan_children(parent: &StagedOrder, child: &StagedOrder) -> Result<Vec<u64>> {
    let missing_suffix = || {
        ArpeggioError::build_failed(
            "trie",
            format!(
                "a {}-gram has no matching {}-gram suffix; the model is not suffix-closed",
                child.order, parent.order
            ),
        )
    };
    let mut begin = vec![0u64; parent.len() + 1];
    let mut i = 0usize;
    for p in 0..parent.len() {
        begin[p] = i as u64;
        while i < child.len() {
            match cmp_suffix(child, i, parent, p) {
                Ordering::Less => return Err(missing_suffix()),
                Ordering::Equal => i += 1,
                Ordering::Greater => break,
            }
        }
    }
    begin[parent.len()] = i as u64;
    if i != child.len() {
        return Err(missing_suffix());
    }
    Ok(begin)
}

/// Child-range starts per word id for the unigram level. Every word id
/// exists at the first level, so no closure check is needed.
fn unigram_children(vocab_len: usize, bigrams: &StagedOrder) -> Vec<u64> {
    let n = bigrams.len();
    let mut next = vec![0u64; vocab_len + 1];
    let mut i = 0usize;
    for w in 0..vocab_len {
        next[w] = i as u64;
        while i < n && bigrams.word(i, 1) == w as WordId {
            i += 1;
        }
    }
    next[vocab_len] = n as u64;
    next
}

fn assemble_trie(
    order: usize,
    mut staged: Vec<StagedOrder>,
    uni_probs: Vec<f32>,
    uni_backoffs: Vec<f32>,
    vocab_len: usize,
    quant_config: Option<QuantConfig>,
) -> Result<TrieSearch> {
    for st in &mut staged {
        sort_level(st);
    }

    let quant = quant_config.map(|qc| {
        let probs = staged.iter().map(|st| st.probs.clone()).collect();
        let backoffs = staged
            .iter()
            .filter(|st| st.order < order)
            .map(|st| st.backoffs.clone())
            .collect();
        QuantTables::train(qc, probs, backoffs)
    });

    let word_bits = required_bits(vocab_len.saturating_sub(1) as u64).max(1);
    let (prob_bits, backoff_bits) = match &quant {
        Some(q) => (q.prob_bits(), q.backoff_bits()),
        None => (32, 32),
    };

    let next = unigram_children(vocab_len, &staged[0]);
    let unigram = TrieUnigram::new(uni_probs, uni_backoffs, next);

    let mut middles = Vec::with_capacity(order - 2);
    for k in 2..order {
        let level = k - 2;
        let st = &staged[level];
        let child = &staged[level + 1];
        let child_begin = scan_children(st, child)?;
        let child_count = child.len() as u64;
        let ptr_bits = required_bits(child_count).max(1);
        let mut builder =
            MiddleBuilder::new(st.len() as u64, word_bits, prob_bits, backoff_bits, ptr_bits);
        for r in 0..st.len() {
            let prob_code = match &quant {
                Some(q) => q.encode_middle_prob(level, st.probs[r]),
                None => u64::from(st.probs[r].to_bits()),
            };
            let backoff_code = match &quant {
                Some(q) => q.encode_middle_backoff(level, st.backoffs[r]),
                None => u64::from(st.backoffs[r].to_bits()),
            };
            builder.push(st.word(r, 0), prob_code, backoff_code, child_begin[r]);
        }
        middles.push(builder.finish(child_count));
    }

    let st = &staged[order - 2];
    let mut builder = LongestBuilder::new(st.len() as u64, word_bits, prob_bits);
    for r in 0..st.len() {
        let prob_code = match &quant {
            Some(q) => q.encode_longest_prob(st.probs[r]),
            None => u64::from(st.probs[r].to_bits()),
        };
        builder.push(st.word(r, 0), prob_code);
    }

    Ok(TrieSearch::new(unigram, middles, builder.finish(), quant))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(arpa: &str, config: &Config) -> Result<ModelInner> {
        ModelBuilder::from_arpa_reader(arpa.as_bytes(), config)
    }

    #[test]
    fn test_count_mismatch_is_format_error() {
        let text = "\
\\data\\
ngram 1=5
ngram 2=1

\\1-grams:
-1.0\t<unk>
-1.0\ta
-1.0\tb
-1.0\tc

\\2-grams:
-0.5\ta b

\\end\\
";
        let err = build(text, &Config::default()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
        assert!(err.to_string().contains("declares 5"));
    }

    #[test]
    fn test_unigram_only_model_rejected() {
        let text = "\
\\data\\
ngram 1=1

\\1-grams:
-1.0\t<unk>

\\end\\
";
        let err = build(text, &Config::default()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)));
    }

    #[test]
    fn test_order_above_maximum_rejected() {
        let mut text = String::from("\\data\\\n");
        for k in 1..=7 {
            text.push_str(&format!("ngram {k}=1\n"));
        }
        text.push('\n');
        let err = build(&text, &Config::default()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_suffix_closure_violation_is_build_error() {
        // The trigram "a b c" needs the bigram "b c", which is absent.
        let text = "\
\\data\\
ngram 1=4
ngram 2=1
ngram 3=1

\\1-grams:
-1.0\t<unk>
-1.0\ta
-1.0\tb
-1.0\tc

\\2-grams:
-0.5\ta b\t-0.1

\\3-grams:
-0.4\ta b c

\\end\\
";
        let config = Config {
            backend: BackendKind::Trie,
            ..Config::default()
        };
        let err = build(text, &config).unwrap_err();
        assert!(matches!(err, ArpeggioError::Build(_)), "{err}");
        assert!(err.to_string().contains("suffix-closed"));
    }

    #[test]
    fn test_reserved_tokens_always_present() {
        // No <unk>, <s>, or </s> anywhere in the text model; all three
        // must still resolve, with hallucinated unigram records.
        let text = "\
\\data\\
ngram 1=2
ngram 2=1

\\1-grams:
-0.4\ta\t-0.2
-0.6\tb

\\2-grams:
-0.5\ta b

\\end\\
";
        for backend in [BackendKind::Probing, BackendKind::Trie] {
            let config = Config {
                backend,
                ..Config::default()
            };
            let inner = build(text, &config).unwrap();
            let model = crate::model::Model::from_inner(inner);
            assert!(model.contains("<unk>"));
            assert!(model.contains("<s>"));
            assert!(model.contains("</s>"));
            assert_eq!(model.vocab_len(), 5);

            let scorer = crate::scorer::Scorer::new(model);
            let total = scorer.score("a b").unwrap();
            // p(a|<s>) backs off to the hallucinated <s> unigram's zero
            // backoff plus p(a); p(b|a) = -0.5; p(</s>|b) falls back to
            // the hallucinated </s> unigram.
            let expected = -0.4f32 + -0.5 + -100.0;
            assert!((total - expected).abs() < 1e-3, "{total}");
        }
    }

    #[test]
    fn test_probing_accepts_what_trie_rejects_structurally() {
        // The probing backend has no level links, so the same input
        // builds; orphaned records are simply unreachable in scoring.
        let text = "\
\\data\\
ngram 1=4
ngram 2=1
ngram 3=1

\\1-grams:
-1.0\t<unk>
-1.0\ta
-1.0\tb
-1.0\tc

\\2-grams:
-0.5\ta b\t-0.1

\\3-grams:
-0.4\ta b c

\\end\\
";
        assert!(build(text, &Config::default()).is_ok());
    }
}
