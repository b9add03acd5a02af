//! Learned sentence-boundary recognizer.
//!
//! A sequence labeler over the fixed two-label scheme `{"I", "S"}`: `S`
//! opens a sentence, `I` continues one. Boundaries are written through the
//! tri-state flag and never overwrite an already-decided boundary, so the
//! recognizer composes with rule-based segmentation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{sequence_loss, Annotatable, Pipe, Scorable, Trainable};
use crate::doc::{encode_tokens, Boundary, Document, Example};
use crate::error::{Error, Result};
use crate::labels::LabelSet;
use crate::model::{
    argmax_rows, Activation, LinearModel, ModelSlot, Optimizer, ScoreMatrix, ScoredModel,
    SgdOptimizer,
};
use crate::serialize::{
    excluded, ComponentArchive, Persist, SECTION_CFG, SECTION_MODEL,
};

/// Label id for "inside sentence".
const INSIDE: usize = 0;
/// Label id for "sentence start".
const START: usize = 1;

/// Sentence-recognizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceRecognizerConfig {
    /// Width of the hashed token-feature input rows.
    pub token_vector_width: usize,
}

impl Default for SentenceRecognizerConfig {
    fn default() -> Self {
        Self {
            token_vector_width: 64,
        }
    }
}

/// Statistical sentence-boundary recognizer.
pub struct SentenceRecognizer {
    name: String,
    cfg: SentenceRecognizerConfig,
    labels: LabelSet,
    model: ModelSlot,
}

impl SentenceRecognizer {
    /// Create an untrained recognizer.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut labels = LabelSet::new();
        // Fixed scheme; ids must match INSIDE/START.
        labels.add("I").expect("static label");
        labels.add("S").expect("static label");
        Self {
            name: name.into(),
            cfg: SentenceRecognizerConfig::default(),
            labels,
            model: ModelSlot::Uninitialized,
        }
    }

    /// Install a scoring model directly (tests and custom architectures).
    pub fn set_model(&mut self, model: Box<dyn ScoredModel>) {
        self.model.set(model);
    }

    /// Whether the model has been built.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    fn align_gold(&self, examples: &[Example]) -> Vec<Option<usize>> {
        let mut gold = Vec::new();
        for example in examples {
            for i in 0..example.doc.len() {
                let id = example
                    .gold
                    .sent_starts
                    .get(i)
                    .and_then(|s| *s)
                    .map(|is_start| if is_start { START } else { INSIDE });
                gold.push(id);
            }
        }
        gold
    }

    fn batch_inputs(&self, examples: &[Example]) -> Result<ScoreMatrix> {
        let encoded: Vec<ScoreMatrix> = examples
            .iter()
            .map(|e| encode_tokens(&e.doc, self.cfg.token_vector_width))
            .collect();
        ScoreMatrix::vstack(&encoded, self.cfg.token_vector_width)
    }
}

impl Scorable for SentenceRecognizer {
    type Scores = Vec<ScoreMatrix>;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        let model = self.model.get(&self.name)?;
        crate::component::score_token_batch(model, docs)
    }
}

impl Annotatable for SentenceRecognizer {
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores) {
        for (doc, doc_scores) in docs.iter_mut().zip(scores) {
            let ids = argmax_rows(doc_scores);
            for (token, &id) in doc.tokens.iter_mut().zip(&ids) {
                if token.sent_start != Boundary::Unset {
                    continue; // already decided
                }
                token.sent_start = if id == START {
                    Boundary::Start
                } else {
                    Boundary::Inside
                };
            }
        }
    }
}

impl Trainable for SentenceRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(
        &mut self,
        examples: &[Example],
        dropout: f32,
        sgd: Option<&mut dyn Optimizer>,
        losses: &mut HashMap<String, f32>,
    ) -> Result<()> {
        let total: usize = examples.iter().map(|e| e.doc.len()).sum();
        if total == 0 {
            return Ok(());
        }
        let gold = self.align_gold(examples);
        let inputs = self.batch_inputs(examples)?;
        let model = self.model.get_mut(&self.name)?;
        model.set_dropout(dropout);
        let scores = model.begin_update(&inputs)?;
        let batch = sequence_loss(&scores, &gold)?;
        model.backprop(&batch.d_scores)?;
        if let Some(sgd) = sgd {
            model.finish_update(sgd)?;
        }
        *losses.entry(self.name.clone()).or_insert(0.0) += batch.loss;
        Ok(())
    }

    fn begin_training(
        &mut self,
        _examples: &[Example],
        sgd: Option<Box<dyn Optimizer>>,
    ) -> Result<Box<dyn Optimizer>> {
        if !self.model.is_ready() {
            debug!(component = %self.name, "building sentence recognizer model");
            self.model.set(Box::new(LinearModel::new(
                self.cfg.token_vector_width,
                self.labels.len(),
                Activation::Softmax,
            )));
        }
        Ok(sgd.unwrap_or_else(|| Box::new(SgdOptimizer::default()) as Box<dyn Optimizer>))
    }

    fn add_label(&mut self, label: &str) -> Result<usize> {
        if self.labels.contains(label) {
            return Ok(0);
        }
        Err(Error::invalid_label(
            "sentence recognizer uses a fixed I/S label scheme",
        ))
    }
}

impl Pipe for SentenceRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, docs: &mut [Document]) -> Result<()> {
        let scores = self.predict(docs)?;
        self.set_annotations(docs, &scores);
        Ok(())
    }
}

impl Persist for SentenceRecognizer {
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive> {
        let mut archive = ComponentArchive::new();
        if !excluded(SECTION_CFG, exclude) {
            archive.put_json(SECTION_CFG, &self.cfg)?;
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let ModelSlot::Ready(model) = &self.model {
                archive.put_bytes(SECTION_MODEL, model.to_bytes()?);
            }
        }
        Ok(archive)
    }

    fn from_archive(&mut self, archive: &ComponentArchive, exclude: &[&str]) -> Result<()> {
        if !excluded(SECTION_CFG, exclude) {
            if let Some(cfg) = archive.get_json::<SentenceRecognizerConfig>(SECTION_CFG)? {
                self.cfg = cfg;
            }
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let Some(bytes) = archive.get_bytes(SECTION_MODEL) {
                let mut model = LinearModel::new(
                    self.cfg.token_vector_width,
                    self.labels.len(),
                    Activation::Softmax,
                );
                model.load_bytes(bytes)?;
                self.model.set(Box::new(model));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailingModel;

    fn examples() -> Vec<Example> {
        vec![Example::new(Document::from_words(&[
            "Hi", "there", ".", "Bye", "now", ".",
        ]))
        .with_sent_starts(vec![
            Some(true),
            Some(false),
            Some(false),
            Some(true),
            Some(false),
            Some(false),
        ])]
    }

    #[test]
    fn test_predict_unbuilt_fails() {
        let senter = SentenceRecognizer::new("senter");
        let docs = [Document::from_words(&["a"])];
        assert!(matches!(senter.predict(&docs), Err(Error::ModelNotReady(_))));
    }

    #[test]
    fn test_empty_batch_short_circuits() {
        let mut senter = SentenceRecognizer::new("senter");
        senter.set_model(Box::new(FailingModel::new(64, 2)));
        let docs = [Document::default()];
        let scores = senter.predict(&docs).unwrap();
        assert_eq!(scores[0].rows(), 0);
        assert_eq!(scores[0].cols(), 2);
    }

    #[test]
    fn test_decided_boundaries_not_overwritten() {
        let mut senter = SentenceRecognizer::new("senter");
        let mut sgd = senter.begin_training(&examples(), None).unwrap();
        let mut losses = HashMap::new();
        for _ in 0..20 {
            senter
                .update(&examples(), 0.0, Some(sgd.as_mut()), &mut losses)
                .unwrap();
        }
        let mut docs = [Document::from_words(&["Hi", "there", "."])];
        docs[0].tokens[1].sent_start = Boundary::Start; // pre-decided, however odd
        let scores = senter.predict(&docs).unwrap();
        senter.set_annotations(&mut docs, &scores);
        assert_eq!(docs[0].tokens[1].sent_start, Boundary::Start);
        // Undecided tokens got a decision.
        assert_ne!(docs[0].tokens[0].sent_start, Boundary::Unset);
        assert_ne!(docs[0].tokens[2].sent_start, Boundary::Unset);
    }

    #[test]
    fn test_gold_alignment_masks_missing() {
        let senter = SentenceRecognizer::new("senter");
        let ex = Example::new(Document::from_words(&["a", "b"]))
            .with_sent_starts(vec![Some(true), None]);
        let gold = senter.align_gold(&[ex]);
        assert_eq!(gold, vec![Some(START), None]);
    }

    #[test]
    fn test_add_label_fixed_scheme() {
        let mut senter = SentenceRecognizer::new("senter");
        assert_eq!(senter.add_label("S").unwrap(), 0);
        assert!(matches!(senter.add_label("B"), Err(Error::InvalidLabel(_))));
    }

    #[test]
    fn test_update_skips_empty_batch() {
        let mut senter = SentenceRecognizer::new("senter");
        let mut losses = HashMap::new();
        let batch = [Example::new(Document::default())];
        senter.update(&batch, 0.0, None, &mut losses).unwrap();
        assert!(losses.is_empty());
    }
}
