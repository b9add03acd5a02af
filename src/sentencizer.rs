//! Rule-based sentence segmentation.
//!
//! Splits on sentence-final punctuation without any trained model: after a
//! closing punctuation character has been seen, the next token that is not
//! itself punctuation opens a new sentence. Useful as a fast fallback and as
//! a first segmenter that a statistical recognizer then defers to (decided
//! boundaries are never overwritten downstream).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::component::{Annotatable, Pipe, Scorable};
use crate::doc::{Boundary, Document};
use crate::error::Result;
use crate::serialize::{excluded, ComponentArchive, Persist, SECTION_CFG};

/// Default sentence-final punctuation, covering Latin scripts plus common
/// CJK, Arabic, Armenian, Amharic and Devanagari sentence terminators.
fn default_punct_chars() -> BTreeSet<char> {
    [
        '!', '.', '?', '։', '؟', '۔', '܀', '܁', '܂', '߹', '।', '॥', '၊', '။', '።', '፧', '፨',
        '᙮', '᜵', '᜶', '᠃', '᠉', '᥄', '᥅', '᪨', '᪩', '᪪', '᪫', '᭚', '᭛', '᭞', '᭟', '᰻',
        '᰼', '᱾', '᱿', '‼', '‽', '⁇', '⁈', '⁉', '⸮', '⸼', '꓿', '꘎', '꘏', '꛳', '꛷', '꡶',
        '꡷', '꣎', '꣏', '꤯', '꧈', '꧉', '꩝', '꩞', '꩟', '꫰', '꫱', '꯫', '﹒', '﹖', '﹗',
        '！', '．', '？', '𐩖', '𐩗', '𑁇', '𑁈', '𑂾', '𑂿', '𑃀', '𑃁', '𑅁', '𑅂', '𑅃',
        '𑇅', '𑇆', '𑇍', '𑇞', '𑇟', '𑈸', '𑈹', '𑈻', '𑈼', '𑊩', '𑑋', '𑑌', '𑗂', '𑗃',
        '𑗉', '𑗊', '𑗋', '𑗌', '𑗍', '𑗎', '𑗏', '𑗐', '𑗑', '𑗒', '𑗓', '𑗔', '𑗕', '𑗖',
        '𑗗', '𑙁', '𑙂', '𑜼', '𑜽', '𑜾', '𑩂', '𑩃', '𑪛', '𑪜', '𑱁', '𑱂', '𖩮', '𖩯',
        '𖫵', '𖬷', '𖬸', '𖭄', '𛲟', '𝪈', '。', '｡',
    ]
    .into_iter()
    .collect()
}

/// Configuration: the characters treated as sentence-final punctuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentencizerConfig {
    /// Sentence-final punctuation characters.
    pub punct_chars: BTreeSet<char>,
}

impl Default for SentencizerConfig {
    fn default() -> Self {
        Self {
            punct_chars: default_punct_chars(),
        }
    }
}

/// Punctuation-driven sentence segmenter. Stateless and model-free.
pub struct Sentencizer {
    name: String,
    cfg: SentencizerConfig,
}

impl Sentencizer {
    /// Create a segmenter with the default punctuation set.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: SentencizerConfig::default(),
        }
    }

    /// Create a segmenter with a custom punctuation set.
    #[must_use]
    pub fn with_punct_chars(name: impl Into<String>, punct_chars: BTreeSet<char>) -> Self {
        Self {
            name: name.into(),
            cfg: SentencizerConfig { punct_chars },
        }
    }

    fn is_sentence_punct(&self, text: &str) -> bool {
        text.chars().all(|c| self.cfg.punct_chars.contains(&c)) && !text.is_empty()
    }

    /// Per-token start flags for one document.
    ///
    /// Token 0 always starts a sentence. After a sentence-final punctuation
    /// token, the next token that is neither generic punctuation nor another
    /// terminator opens a new sentence (so `?!` and `..."` stay attached to
    /// the sentence they close).
    fn starts(&self, doc: &Document) -> Vec<bool> {
        let mut starts = vec![false; doc.len()];
        let mut seen_period = false;
        for (i, token) in doc.tokens.iter().enumerate() {
            if i == 0 {
                starts[0] = true;
            } else if seen_period && !token.is_punct() && !self.is_sentence_punct(&token.text) {
                starts[i] = true;
                seen_period = false;
            }
            if self.is_sentence_punct(&token.text) {
                seen_period = true;
            }
        }
        starts
    }

    /// Segment documents directly, outside of a pipeline.
    pub fn segment(&self, docs: &mut [Document]) {
        let flags: Vec<Vec<bool>> = docs.iter().map(|d| self.starts(d)).collect();
        self.set_annotations(docs, &flags);
    }
}

impl Scorable for Sentencizer {
    type Scores = Vec<Vec<bool>>;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        Ok(docs.iter().map(|d| self.starts(d)).collect())
    }
}

impl Annotatable for Sentencizer {
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores) {
        for (doc, starts) in docs.iter_mut().zip(scores) {
            for (token, &is_start) in doc.tokens.iter_mut().zip(starts) {
                if token.sent_start != Boundary::Unset {
                    continue; // already decided
                }
                token.sent_start = if is_start {
                    Boundary::Start
                } else {
                    Boundary::Inside
                };
            }
        }
    }
}

impl Pipe for Sentencizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, docs: &mut [Document]) -> Result<()> {
        let scores = self.predict(docs)?;
        self.set_annotations(docs, &scores);
        Ok(())
    }
}

impl Persist for Sentencizer {
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive> {
        let mut archive = ComponentArchive::new();
        if !excluded(SECTION_CFG, exclude) {
            archive.put_json(SECTION_CFG, &self.cfg)?;
        }
        Ok(archive)
    }

    fn from_archive(&mut self, archive: &ComponentArchive, exclude: &[&str]) -> Result<()> {
        if !excluded(SECTION_CFG, exclude) {
            if let Some(cfg) = archive.get_json::<SentencizerConfig>(SECTION_CFG)? {
                self.cfg = cfg;
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn first_token_always_starts(words in proptest::collection::vec("[a-z.!?]{1,4}", 1..16)) {
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            let doc = Document::from_words(&refs);
            let starts = Sentencizer::new("sentencizer").starts(&doc);
            prop_assert!(starts[0]);
            prop_assert_eq!(starts.len(), doc.len());
        }
    }
}
