//! Document and gold-annotation data model.
//!
//! A [`Document`] is an ordered sequence of tokens with per-token mutable
//! annotation slots, created by an external tokenizer and mutated in place by
//! each pipeline component's annotate step. An [`Example`] pairs a document
//! with gold-standard annotations for training.
//!
//! # Add-only annotation contract
//!
//! Components only ever *fill in* annotation slots. A field that is already
//! meaningfully set (a tag, a decided sentence boundary, a category score, a
//! knowledge-base link) is never overwritten by a downstream component. This
//! is what makes composing several components over the same document safe.

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::model::ScoreMatrix;

/// Tri-state sentence-boundary flag on a token.
///
/// Starts out [`Boundary::Unset`]; a segmenter decides `Start` or `Inside`
/// exactly once, and later components leave a decided boundary alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Boundary {
    /// No segmenter has decided this token yet.
    #[default]
    Unset,
    /// Token opens a sentence.
    Start,
    /// Token continues the current sentence.
    Inside,
}

/// A single token with its mutable annotation slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Surface form.
    pub text: String,
    /// Fine-grained tag (written by the tagger).
    pub tag: Option<String>,
    /// Coarse part-of-speech (written by the tagger via the tag map).
    pub pos: Option<String>,
    /// Lemma. Kept only when it carries information beyond the lowercased
    /// surface form.
    pub lemma: Option<String>,
    /// Knowledge-base identifier (written by the entity disambiguator).
    pub ent_kb_id: Option<String>,
    /// Sentence-boundary flag.
    pub sent_start: Boundary,
}

impl Token {
    /// Create an unannotated token.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tag: None,
            pos: None,
            lemma: None,
            ent_kb_id: None,
            sent_start: Boundary::Unset,
        }
    }

    /// Whether the token consists entirely of punctuation characters.
    #[must_use]
    pub fn is_punct(&self) -> bool {
        !self.text.is_empty()
            && self
                .text
                .chars()
                .all(|c| c.is_ascii_punctuation() || (!c.is_alphanumeric() && !c.is_whitespace()))
    }

    /// The token's default orthographic form (lowercased surface form).
    #[must_use]
    pub fn orth_default(&self) -> String {
        self.text.to_lowercase()
    }
}

/// An entity mention span over token indices, with an optional KB link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySpan {
    /// First token index (inclusive).
    pub start: usize,
    /// One past the last token index (exclusive).
    pub end: usize,
    /// Entity type label (e.g. "PER", "ORG").
    pub label: String,
    /// Knowledge-base identifier once disambiguated.
    pub kb_id: Option<String>,
}

impl EntitySpan {
    /// Create an unlinked entity span.
    #[must_use]
    pub fn new(start: usize, end: usize, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
            kb_id: None,
        }
    }
}

/// An ordered sequence of tokens with document-level annotation slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Tokens in document order.
    pub tokens: Vec<Token>,
    /// Recognized entity mention spans.
    pub ents: Vec<EntitySpan>,
    /// Per-document category scores (written by the classifier).
    pub cats: HashMap<String, f32>,
}

impl Document {
    /// Build a document from plain words (test/demo convenience; real
    /// tokenization is an external collaborator's job).
    #[must_use]
    pub fn from_words(words: &[&str]) -> Self {
        Self {
            tokens: words.iter().copied().map(Token::new).collect(),
            ents: Vec::new(),
            cats: HashMap::new(),
        }
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the document has no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Sentence token ranges derived from the boundary flags.
    ///
    /// Token 0 always opens the first sentence; every `Start` flag after it
    /// opens a new one. Tokens with undecided boundaries fall into the
    /// sentence opened most recently.
    #[must_use]
    pub fn sentences(&self) -> Vec<Range<usize>> {
        if self.tokens.is_empty() {
            return Vec::new();
        }
        let mut ranges = Vec::new();
        let mut start = 0;
        for (i, token) in self.tokens.iter().enumerate().skip(1) {
            if token.sent_start == Boundary::Start {
                ranges.push(start..i);
                start = i;
            }
        }
        ranges.push(start..self.tokens.len());
        ranges
    }

    /// Index of the sentence containing `token_idx`, if any.
    #[must_use]
    pub fn sentence_of(&self, token_idx: usize) -> Option<usize> {
        self.sentences()
            .iter()
            .position(|r| r.contains(&token_idx))
    }
}

/// Gold-standard annotations for one document.
///
/// All per-token vectors are aligned with the document's tokens; `None`
/// entries mean "no gold label at this position" and are masked out of the
/// loss rather than raising.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoldParse {
    /// Gold fine-grained tags.
    pub tags: Vec<Option<String>>,
    /// Gold dependency heads (token index of each token's head; a root's
    /// entry points at itself or is `None`).
    pub heads: Vec<Option<usize>>,
    /// Gold dependency labels.
    pub deps: Vec<Option<String>>,
    /// Gold sentence starts.
    pub sent_starts: Vec<Option<bool>>,
    /// Gold entity type per token (BILOU-free, plain type name).
    pub ent_types: Vec<Option<String>>,
    /// Gold category truth values. Labels absent from the map are *missing*,
    /// not negative, and are masked out of the classifier loss.
    pub cats: HashMap<String, f32>,
    /// Gold entity links: mention token span -> KB id -> truth value.
    pub links: HashMap<(usize, usize), HashMap<String, bool>>,
}

/// A document paired with its gold annotations. Owned by the training driver
/// and read-only to components during loss computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    /// The (possibly partially annotated) document.
    pub doc: Document,
    /// Gold-standard annotations aligned with `doc`.
    pub gold: GoldParse,
}

impl Example {
    /// Wrap a document with empty gold annotations.
    #[must_use]
    pub fn new(doc: Document) -> Self {
        Self {
            doc,
            gold: GoldParse::default(),
        }
    }

    /// Attach gold tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<Option<String>>) -> Self {
        self.gold.tags = tags;
        self
    }

    /// Attach gold sentence starts.
    #[must_use]
    pub fn with_sent_starts(mut self, starts: Vec<Option<bool>>) -> Self {
        self.gold.sent_starts = starts;
        self
    }

    /// Attach gold categories.
    #[must_use]
    pub fn with_cats(mut self, cats: HashMap<String, f32>) -> Self {
        self.gold.cats = cats;
        self
    }
}

// =============================================================================
// Feature encoding
// =============================================================================

/// Hash a feature string into a column bucket.
///
/// 64-bit FNV-1a, spelled out here because persisted model parameters depend
/// on these buckets: the standard hasher's algorithm is unspecified and may
/// change between toolchain releases.
fn bucket(feature: &str, width: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in feature.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash as usize) % width
}

/// Word-shape feature: runs of upper/lower/digit collapsed to `X`/`x`/`d`.
fn shape(text: &str) -> String {
    let mut out = String::new();
    let mut last = '\0';
    for c in text.chars() {
        let s = if c.is_uppercase() {
            'X'
        } else if c.is_lowercase() {
            'x'
        } else if c.is_ascii_digit() {
            'd'
        } else {
            c
        };
        if s != last {
            out.push(s);
            last = s;
        }
    }
    out
}

/// Encode a document's tokens as hashed-feature rows, one row per token.
///
/// The encoding is deterministic (stable hashing of surface features into
/// `width` buckets, L2-normalized per row), so models see identical inputs
/// for identical documents across runs and serialization round-trips.
#[must_use]
pub fn encode_tokens(doc: &Document, width: usize) -> ScoreMatrix {
    let mut matrix = ScoreMatrix::zeros(doc.len(), width);
    for (i, token) in doc.tokens.iter().enumerate() {
        let lower = token.text.to_lowercase();
        let prefix: String = lower.chars().take(1).collect();
        let suffix: String = {
            let chars: Vec<char> = lower.chars().collect();
            chars[chars.len().saturating_sub(3)..].iter().collect()
        };
        let feats = [
            format!("lower={lower}"),
            format!("prefix={prefix}"),
            format!("suffix={suffix}"),
            format!("shape={}", shape(&token.text)),
        ];
        let row = matrix.row_mut(i);
        for feat in &feats {
            row[bucket(feat, width)] += 1.0;
        }
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in row.iter_mut() {
                *v /= norm;
            }
        }
    }
    matrix
}

/// Encode a token range as the mean of its token feature rows.
///
/// Used for per-document classification inputs and per-sentence context
/// encodings. An empty range yields the zero vector.
#[must_use]
pub fn encode_span(doc: &Document, range: Range<usize>, width: usize) -> Vec<f32> {
    let tokens = encode_tokens(doc, width);
    let mut mean = vec![0.0f32; width];
    let count = range.len();
    if count == 0 {
        return mean;
    }
    for i in range {
        for (m, v) in mean.iter_mut().zip(tokens.row(i)) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= count as f32;
    }
    mean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentences_single() {
        let doc = Document::from_words(&["Hello", "world"]);
        assert_eq!(doc.sentences(), vec![0..2]);
    }

    #[test]
    fn test_sentences_split_on_start_flags() {
        let mut doc = Document::from_words(&["Hi", "there", ".", "Bye", "now", "."]);
        doc.tokens[0].sent_start = Boundary::Start;
        doc.tokens[3].sent_start = Boundary::Start;
        assert_eq!(doc.sentences(), vec![0..3, 3..6]);
        assert_eq!(doc.sentence_of(4), Some(1));
        assert_eq!(doc.sentence_of(2), Some(0));
    }

    #[test]
    fn test_sentences_empty_doc() {
        let doc = Document::default();
        assert!(doc.sentences().is_empty());
        assert_eq!(doc.sentence_of(0), None);
    }

    #[test]
    fn test_is_punct() {
        assert!(Token::new(".").is_punct());
        assert!(Token::new("?!").is_punct());
        assert!(!Token::new("a.").is_punct());
        assert!(!Token::new("word").is_punct());
        assert!(!Token::new("").is_punct());
    }

    #[test]
    fn test_shape_collapses_runs() {
        assert_eq!(shape("Hello"), "Xx");
        assert_eq!(shape("ABC123"), "Xd");
        assert_eq!(shape("a-b"), "x-x");
    }

    #[test]
    fn test_encode_tokens_deterministic() {
        let doc = Document::from_words(&["Apple", "shares", "rose"]);
        let a = encode_tokens(&doc, 32);
        let b = encode_tokens(&doc, 32);
        assert_eq!(a, b);
        assert_eq!(a.rows(), 3);
        assert_eq!(a.cols(), 32);
    }

    #[test]
    fn test_encode_tokens_rows_normalized() {
        let doc = Document::from_words(&["normalize", "me"]);
        let m = encode_tokens(&doc, 16);
        for i in 0..m.rows() {
            let norm: f32 = m.row(i).iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bucket_values_pinned() {
        // Golden FNV-1a values: these must never change, or persisted model
        // parameters stop lining up with their feature columns.
        assert_eq!(bucket("lower=the", 64), 28);
        assert_eq!(bucket("shape=Xx", 64), 25);
        assert_eq!(bucket("prefix=t", 64), 24);
        assert_eq!(bucket("suffix=the", 16), 6);
    }

    #[test]
    fn test_encode_span_empty_range_is_zero() {
        let doc = Document::from_words(&["a", "b"]);
        let v = encode_span(&doc, 1..1, 8);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encode_never_panics(words in proptest::collection::vec("[a-zA-Z0-9.,!?]{0,8}", 0..12)) {
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            let doc = Document::from_words(&refs);
            let m = encode_tokens(&doc, 16);
            prop_assert_eq!(m.rows(), doc.len());
        }

        #[test]
        fn sentences_cover_all_tokens(flags in proptest::collection::vec(0u8..3, 1..20)) {
            let words: Vec<&str> = flags.iter().map(|_| "w").collect();
            let mut doc = Document::from_words(&words);
            for (token, f) in doc.tokens.iter_mut().zip(&flags) {
                token.sent_start = match f {
                    0 => Boundary::Unset,
                    1 => Boundary::Start,
                    _ => Boundary::Inside,
                };
            }
            let total: usize = doc.sentences().iter().map(|r| r.len()).sum();
            prop_assert_eq!(total, doc.len());
        }
    }
}
