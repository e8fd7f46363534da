//! Streaming reader for text models in the ARPA exchange format.
//!
//! The reader pulls one record at a time off any [`BufRead`] source and
//! never materializes more than a single line, so text models larger than
//! RAM build in bounded memory. Probabilities and backoffs are kept exactly
//! as written (log10); the reader performs no renormalization.

use std::io::BufRead;

use crate::errors::{ArpeggioError, Result};

/// One n-gram record of the section currently being read.
///
/// Borrows the reader's line buffer; the next call to
/// [`ArpaReader::next_ngram`] invalidates it.
#[derive(Debug)]
pub struct ArpaNgram<'a> {
    /// Log10 probability, exactly as written in the text model.
    pub prob: f32,

    /// Log10 backoff weight; `None` when the line carries no backoff field.
    pub backoff: Option<f32>,

    words: &'a str,
}

impl<'a> ArpaNgram<'a> {
    /// Iterates over the words of this record, in sentence order.
    pub fn words(&self) -> impl Iterator<Item = &'a str> {
        self.words.split_whitespace()
    }
}

/// Pull-based reader over the sections of an ARPA file.
///
/// Usage follows the file layout: construct (which consumes the `\data\`
/// header), then for each order call [`read_ngram_header`] followed by
/// exactly the declared number of [`next_ngram`] calls, then [`read_end`].
///
/// [`read_ngram_header`]: ArpaReader::read_ngram_header
/// [`next_ngram`]: ArpaReader::next_ngram
/// [`read_end`]: ArpaReader::read_end
#[derive(Debug)]
pub struct ArpaReader<R> {
    rdr: R,
    line: String,
    spans: Vec<(usize, usize)>,
    counts: Vec<u64>,
    section: usize,
    declared: u64,
    seen: u64,
}

impl<R> ArpaReader<R>
where
    R: BufRead,
{
    /// Creates a reader, consuming the `\data\` header and the per-order
    /// count declarations.
    ///
    /// # Errors
    ///
    /// [`ArpeggioError`] is returned when the header is missing or
    /// malformed, when count declarations are not consecutive from order 1,
    /// or when the source looks like a gzip stream.
    pub fn new(mut rdr: R) -> Result<Self> {
        let head = rdr.fill_buf()?;
        if head.starts_with(&[0x1f, 0x8b]) {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                "the input looks like a gzip file; decompress it before building",
            ));
        }

        let mut this = Self {
            rdr,
            line: String::new(),
            spans: Vec::new(),
            counts: Vec::new(),
            section: 0,
            declared: 0,
            seen: 0,
        };

        if !this.next_nonblank_line()? {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                "unexpected end of file before \\data\\",
            ));
        }
        if this.line != "\\data\\" {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!("expected \\data\\ but got \"{}\"", this.line),
            ));
        }

        loop {
            if !this.next_line()? || this.line.trim().is_empty() {
                break;
            }
            let Some(decl) = this.line.strip_prefix("ngram ") else {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!("count line \"{}\" does not begin with \"ngram \"", this.line),
                ));
            };
            let Some((order_str, count_str)) = decl.split_once('=') else {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!("expected = in the count line \"{}\"", this.line),
                ));
            };
            let order: usize = order_str.trim().parse().map_err(|_| {
                ArpeggioError::invalid_format(
                    "arpa",
                    format!("unparseable order in the count line \"{}\"", this.line),
                )
            })?;
            let count: u64 = count_str.trim().parse().map_err(|_| {
                ArpeggioError::invalid_format(
                    "arpa",
                    format!("unparseable count in the count line \"{}\"", this.line),
                )
            })?;
            if order != this.counts.len() + 1 {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!(
                        "n-gram orders must be consecutive starting with 1; got \"{}\"",
                        this.line
                    ),
                ));
            }
            this.counts.push(count);
        }

        if this.counts.is_empty() {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                "no ngram count declarations after \\data\\",
            ));
        }
        Ok(this)
    }

    /// The maximum n-gram order declared by the model.
    pub fn order(&self) -> usize {
        self.counts.len()
    }

    /// The declared record count for each order, starting at order 1.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Consumes the `\k-grams:` section header for `order`.
    ///
    /// # Errors
    ///
    /// [`ArpeggioError`] is returned when the next non-blank line is not
    /// the expected header. An unexpected n-gram line here means the
    /// previous section held more records than its declaration.
    pub fn read_ngram_header(&mut self, order: usize) -> Result<()> {
        if !self.next_nonblank_line()? {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!("unexpected end of file; expected \\{order}-grams:"),
            ));
        }
        let expected = format!("\\{order}-grams:");
        if self.line != expected {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!(
                    "expected {expected} but got \"{}\" (section contents must match the declared counts)",
                    self.line
                ),
            ));
        }
        self.section = order;
        self.declared = self.counts[order - 1];
        self.seen = 0;
        Ok(())
    }

    /// Reads the next record of the current section.
    ///
    /// A record line is `probability` then the section's word count of
    /// words, then an optional backoff weight, whitespace-separated. A
    /// missing backoff field is reported as `None` (weight 0); a non-zero
    /// backoff on a maximum-order record is rejected, since nothing can
    /// back off to a longer context.
    ///
    /// # Errors
    ///
    /// [`ArpeggioError`] is returned when the section ends before the
    /// declared count is reached or the line cannot be parsed.
    pub fn next_ngram(&mut self) -> Result<ArpaNgram<'_>> {
        let order = self.section;
        if !self.next_line()? || self.line.trim().is_empty() || self.line.starts_with('\\') {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!(
                    "the \\{order}-grams section declares {} entries but supplies {}",
                    self.declared, self.seen
                ),
            ));
        }

        self.spans.clear();
        let base = self.line.as_ptr() as usize;
        for tok in self.line.split_whitespace() {
            let start = tok.as_ptr() as usize - base;
            self.spans.push((start, start + tok.len()));
        }

        let has_backoff = match self.spans.len() {
            n if n == order + 1 => false,
            n if n == order + 2 => true,
            _ => {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!(
                        "malformed {order}-gram line \"{}\"; expected probability, {order} word(s), optional backoff",
                        self.line
                    ),
                ));
            }
        };

        let field = |i: usize| {
            let (a, b) = self.spans[i];
            &self.line[a..b]
        };

        let prob: f32 = field(0).parse().map_err(|_| {
            ArpeggioError::invalid_format(
                "arpa",
                format!("unparseable probability in line \"{}\"", self.line),
            )
        })?;

        let backoff = if has_backoff {
            let weight: f32 = field(order + 1).parse().map_err(|_| {
                ArpeggioError::invalid_format(
                    "arpa",
                    format!("unparseable backoff in line \"{}\"", self.line),
                )
            })?;
            if order == self.counts.len() && weight != 0.0 {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!(
                        "non-zero backoff {weight} on a maximum-order n-gram: \"{}\"",
                        self.line
                    ),
                ));
            }
            Some(weight)
        } else {
            None
        };

        self.seen += 1;
        let words_start = self.spans[1].0;
        let words_end = self.spans[order].1;
        Ok(ArpaNgram {
            prob,
            backoff,
            words: &self.line[words_start..words_end],
        })
    }

    /// Consumes the `\end\` marker and verifies nothing but whitespace
    /// follows it.
    ///
    /// # Errors
    ///
    /// [`ArpeggioError`] is returned when the marker is missing or the file
    /// continues with non-blank content.
    pub fn read_end(&mut self) -> Result<()> {
        if !self.next_nonblank_line()? {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                "unexpected end of file; expected \\end\\",
            ));
        }
        if self.line != "\\end\\" {
            return Err(ArpeggioError::invalid_format(
                "arpa",
                format!("expected \\end\\ but got \"{}\"", self.line),
            ));
        }
        while self.next_line()? {
            if !self.line.trim().is_empty() {
                return Err(ArpeggioError::invalid_format(
                    "arpa",
                    format!("trailing line \"{}\" after \\end\\", self.line),
                ));
            }
        }
        Ok(())
    }

    fn next_line(&mut self) -> Result<bool> {
        self.line.clear();
        let n = self.rdr.read_line(&mut self.line)?;
        while self.line.ends_with('\n') || self.line.ends_with('\r') {
            self.line.pop();
        }
        Ok(n != 0)
    }

    fn next_nonblank_line(&mut self) -> Result<bool> {
        loop {
            if !self.next_line()? {
                return Ok(false);
            }
            if !self.line.trim().is_empty() {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_ARPA: &str = "\
\\data\\
ngram 1=3
ngram 2=2

\\1-grams:
-1.0\t<unk>
-0.5\t<s>\t-0.4
-0.6\t</s>

\\2-grams:
-0.3\t<s> </s>
-0.2\t</s> </s>

\\end\\
";

    #[test]
    fn test_read_counts() {
        let rdr = ArpaReader::new(TINY_ARPA.as_bytes()).unwrap();
        assert_eq!(rdr.order(), 2);
        assert_eq!(rdr.counts(), &[3, 2]);
    }

    #[test]
    fn test_read_records() {
        let mut rdr = ArpaReader::new(TINY_ARPA.as_bytes()).unwrap();

        rdr.read_ngram_header(1).unwrap();
        let ng = rdr.next_ngram().unwrap();
        assert_eq!(ng.prob, -1.0);
        assert_eq!(ng.backoff, None);
        assert_eq!(ng.words().collect::<Vec<_>>(), vec!["<unk>"]);
        let ng = rdr.next_ngram().unwrap();
        assert_eq!(ng.backoff, Some(-0.4));
        rdr.next_ngram().unwrap();

        rdr.read_ngram_header(2).unwrap();
        let ng = rdr.next_ngram().unwrap();
        assert_eq!(ng.prob, -0.3);
        assert_eq!(ng.words().collect::<Vec<_>>(), vec!["<s>", "</s>"]);
        rdr.next_ngram().unwrap();

        rdr.read_end().unwrap();
    }

    #[test]
    fn test_count_mismatch_too_few() {
        let text = "\
\\data\\
ngram 1=5

\\1-grams:
-1.0\ta
-1.0\tb
-1.0\tc
-1.0\td

\\end\\
";
        let mut rdr = ArpaReader::new(text.as_bytes()).unwrap();
        rdr.read_ngram_header(1).unwrap();
        for _ in 0..4 {
            rdr.next_ngram().unwrap();
        }
        let err = rdr.next_ngram().unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)), "{err}");
        assert!(err.to_string().contains("declares 5"));
    }

    #[test]
    fn test_missing_data_header() {
        let err = ArpaReader::new("\\1-grams:\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)));
    }

    #[test]
    fn test_nonconsecutive_orders() {
        let text = "\\data\\\nngram 1=1\nngram 3=1\n\n";
        let err = ArpaReader::new(text.as_bytes()).unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)));
    }

    #[test]
    fn test_nonzero_backoff_on_longest_order() {
        let text = "\
\\data\\
ngram 1=1
ngram 2=1

\\1-grams:
-1.0\ta

\\2-grams:
-0.5\ta a\t-0.25

\\end\\
";
        let mut rdr = ArpaReader::new(text.as_bytes()).unwrap();
        rdr.read_ngram_header(1).unwrap();
        rdr.next_ngram().unwrap();
        rdr.read_ngram_header(2).unwrap();
        let err = rdr.next_ngram().unwrap_err();
        assert!(matches!(err, ArpeggioError::Format(_)));
    }

    #[test]
    fn test_malformed_record_line() {
        let text = "\
\\data\\
ngram 1=1

\\1-grams:
-1.0

\\end\\
";
        let mut rdr = ArpaReader::new(text.as_bytes()).unwrap();
        rdr.read_ngram_header(1).unwrap();
        assert!(rdr.next_ngram().is_err());
    }

    #[test]
    fn test_trailing_garbage_after_end() {
        let text = "\
\\data\\
ngram 1=1

\\1-grams:
-1.0\ta

\\end\\
leftover
";
        let mut rdr = ArpaReader::new(text.as_bytes()).unwrap();
        rdr.read_ngram_header(1).unwrap();
        rdr.next_ngram().unwrap();
        assert!(rdr.read_end().is_err());
    }

    #[test]
    fn test_gzip_input_rejected() {
        let bytes = [0x1f, 0x8b, 0x08, 0x00];
        let err = ArpaReader::new(&bytes[..]).unwrap_err();
        assert!(err.to_string().contains("gzip"));
    }
}
