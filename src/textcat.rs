//! Multi-label document classifier.
//!
//! Scores every label independently per document (logistic outputs), so a
//! document can carry several categories at once. Corpora are often only
//! partially annotated: labels absent from an example's gold category map
//! are treated as *missing*, not negative, and are masked out of the loss.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{Annotatable, Pipe, Scorable, Trainable};
use crate::doc::{encode_span, Document, Example};
use crate::error::{Error, Result};
use crate::labels::LabelSet;
use crate::model::{
    Activation, LinearModel, ModelSlot, Optimizer, ScoreMatrix, ScoredModel, SgdOptimizer,
};
use crate::serialize::{
    excluded, ComponentArchive, Persist, SECTION_CFG, SECTION_LABELS, SECTION_MODEL,
};

/// Classifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCategorizerConfig {
    /// Width of the hashed document-feature input rows.
    pub token_vector_width: usize,
}

impl Default for TextCategorizerConfig {
    fn default() -> Self {
        Self {
            token_vector_width: 64,
        }
    }
}

/// Multi-label text categorizer.
pub struct TextCategorizer {
    name: String,
    cfg: TextCategorizerConfig,
    labels: LabelSet,
    model: ModelSlot,
    rehearsal: Option<Box<dyn ScoredModel>>,
}

impl TextCategorizer {
    /// Create an untrained categorizer.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: TextCategorizerConfig::default(),
            labels: LabelSet::new(),
            model: ModelSlot::Uninitialized,
            rehearsal: None,
        }
    }

    /// The classifier's label set.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
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

    /// Capture a frozen snapshot of the current model for rehearsal.
    pub fn resume_training(&mut self) -> Result<()> {
        let model = self.model.get(&self.name)?;
        self.rehearsal = Some(model.clone_frozen());
        Ok(())
    }

    /// One feature row per document (mean of token encodings).
    fn doc_inputs(&self, docs: &[Document]) -> Result<ScoreMatrix> {
        let rows: Vec<Vec<f32>> = docs
            .iter()
            .map(|doc| encode_span(doc, 0..doc.len(), self.cfg.token_vector_width))
            .collect();
        ScoreMatrix::from_rows(rows, self.cfg.token_vector_width)
    }

    /// Loss and gradient with the not-missing mask applied, both normalized
    /// by the batch size.
    fn get_loss(&self, examples: &[Example], scores: &ScoreMatrix) -> Result<(ScoreMatrix, f32)> {
        if scores.rows() != examples.len() {
            return Err(Error::shape_mismatch(examples.len(), scores.rows()));
        }
        let n = examples.len() as f32;
        let mut d_scores = ScoreMatrix::zeros(scores.rows(), scores.cols());
        let mut loss = 0.0;
        for (i, example) in examples.iter().enumerate() {
            let row = scores.row(i);
            let d_row = d_scores.row_mut(i);
            for (j, (&score, d)) in row.iter().zip(d_row.iter_mut()).enumerate() {
                let label = self.labels.name_of(j).unwrap_or_default();
                match example.gold.cats.get(label) {
                    Some(&truth) => {
                        let raw = score - truth;
                        *d = raw / n;
                        loss += raw * raw / n;
                    }
                    None => *d = 0.0, // missing, not negative
                }
            }
        }
        Ok((d_scores, loss))
    }
}

impl Scorable for TextCategorizer {
    type Scores = ScoreMatrix;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        let model = self.model.get(&self.name)?;
        if docs.is_empty() {
            return Ok(ScoreMatrix::zeros(0, model.output_width()));
        }
        let inputs = self.doc_inputs(docs)?;
        let scores = model.predict(&inputs)?;
        if scores.rows() != docs.len() {
            return Err(Error::shape_mismatch(docs.len(), scores.rows()));
        }
        Ok(scores)
    }
}

impl Annotatable for TextCategorizer {
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores) {
        for (i, doc) in docs.iter_mut().enumerate() {
            if i >= scores.rows() {
                break;
            }
            for (j, &score) in scores.row(i).iter().enumerate() {
                let Some(label) = self.labels.name_of(j) else {
                    continue;
                };
                // Already-present scores (hand-authored or earlier
                // components) win.
                doc.cats.entry(label.to_string()).or_insert(score);
            }
        }
    }
}

impl Trainable for TextCategorizer {
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
        let docs: Vec<Document> = examples.iter().map(|e| e.doc.clone()).collect();
        let inputs = self.doc_inputs(&docs)?;
        let model = self.model.get_mut(&self.name)?;
        model.set_dropout(dropout);
        let scores = model.begin_update(&inputs)?;
        let (d_scores, loss) = self.get_loss(examples, &scores)?;
        let model = self.model.get_mut(&self.name)?;
        model.backprop(&d_scores)?;
        if let Some(sgd) = sgd {
            model.finish_update(sgd)?;
        }
        *losses.entry(self.name.clone()).or_insert(0.0) += loss;
        Ok(())
    }

    fn rehearse(
        &mut self,
        examples: &[Example],
        sgd: Option<&mut dyn Optimizer>,
        losses: &mut HashMap<String, f32>,
    ) -> Result<()> {
        let Some(frozen) = &self.rehearsal else {
            return Ok(());
        };
        let total: usize = examples.iter().map(|e| e.doc.len()).sum();
        if total == 0 {
            return Ok(());
        }
        let docs: Vec<Document> = examples.iter().map(|e| e.doc.clone()).collect();
        let inputs = self.doc_inputs(&docs)?;
        let target = frozen.predict(&inputs)?;
        let model = self.model.get_mut(&self.name)?;
        let live = model.begin_update(&inputs)?;
        if live.rows() != target.rows() {
            return Err(Error::shape_mismatch(target.rows(), live.rows()));
        }
        let mut d_scores = ScoreMatrix::zeros(live.rows(), live.cols());
        let mut loss = 0.0;
        for i in 0..live.rows() {
            let d = d_scores.row_mut(i);
            for (j, d_j) in d.iter_mut().enumerate() {
                *d_j = live.row(i)[j] - target.row(i)[j];
                loss += *d_j * *d_j;
            }
        }
        model.backprop(&d_scores)?;
        if let Some(sgd) = sgd {
            model.finish_update(sgd)?;
        }
        *losses.entry(self.name.clone()).or_insert(0.0) += loss;
        Ok(())
    }

    fn begin_training(
        &mut self,
        examples: &[Example],
        sgd: Option<Box<dyn Optimizer>>,
    ) -> Result<Box<dyn Optimizer>> {
        for example in examples {
            let labels: Vec<String> = example.gold.cats.keys().cloned().collect();
            for label in labels {
                self.add_label(&label)?;
            }
        }
        if !self.model.is_ready() {
            debug!(
                component = %self.name,
                labels = self.labels.len(),
                "building text categorizer model"
            );
            self.model.set(Box::new(LinearModel::new(
                self.cfg.token_vector_width,
                self.labels.len().max(1),
                Activation::Logistic,
            )));
        }
        Ok(sgd.unwrap_or_else(|| Box::new(SgdOptimizer::default()) as Box<dyn Optimizer>))
    }

    fn add_label(&mut self, label: &str) -> Result<usize> {
        if label.trim().is_empty() {
            return Err(Error::invalid_label("label must be a non-empty string"));
        }
        if self.labels.contains(label) {
            return Ok(0);
        }
        if let ModelSlot::Ready(model) = &self.model {
            if !model.resizable_output() {
                // A simple ensemble's final layer cannot grow without
                // corrupting its constituent sub-models. Known limitation.
                return Err(Error::model_already_shaped(format!(
                    "cannot add category {label:?} to {:?} after its model was built",
                    self.name
                )));
            }
        }
        self.labels.add(label)?;
        Ok(1)
    }
}

impl Pipe for TextCategorizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, docs: &mut [Document]) -> Result<()> {
        let scores = self.predict(docs)?;
        self.set_annotations(docs, &scores);
        Ok(())
    }
}

impl Persist for TextCategorizer {
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive> {
        let mut archive = ComponentArchive::new();
        if !excluded(SECTION_CFG, exclude) {
            archive.put_json(SECTION_CFG, &self.cfg)?;
        }
        if !excluded(SECTION_LABELS, exclude) {
            archive.put_json(SECTION_LABELS, &self.labels)?;
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
            if let Some(cfg) = archive.get_json::<TextCategorizerConfig>(SECTION_CFG)? {
                self.cfg = cfg;
            }
        }
        if !excluded(SECTION_LABELS, exclude) {
            if let Some(labels) = archive.get_json::<LabelSet>(SECTION_LABELS)? {
                self.labels = labels;
            }
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let Some(bytes) = archive.get_bytes(SECTION_MODEL) {
                let mut model = LinearModel::new(
                    self.cfg.token_vector_width,
                    self.labels.len().max(1),
                    Activation::Logistic,
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

    fn cats(pairs: &[(&str, f32)]) -> HashMap<String, f32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn examples() -> Vec<Example> {
        vec![
            Example::new(Document::from_words(&["great", "fun", "movie"]))
                .with_cats(cats(&[("POSITIVE", 1.0), ("NEGATIVE", 0.0)])),
            Example::new(Document::from_words(&["boring", "awful", "mess"]))
                .with_cats(cats(&[("POSITIVE", 0.0), ("NEGATIVE", 1.0)])),
        ]
    }

    fn trained() -> TextCategorizer {
        let mut textcat = TextCategorizer::new("textcat");
        let examples = examples();
        let mut sgd = textcat.begin_training(&examples, None).unwrap();
        let mut losses = HashMap::new();
        for _ in 0..50 {
            textcat
                .update(&examples, 0.0, Some(sgd.as_mut()), &mut losses)
                .unwrap();
        }
        textcat
    }

    #[test]
    fn test_begin_training_collects_labels() {
        let mut textcat = TextCategorizer::new("textcat");
        textcat.begin_training(&examples(), None).unwrap();
        assert_eq!(textcat.labels().len(), 2);
        assert!(textcat.is_ready());
    }

    #[test]
    fn test_scores_one_row_per_doc() {
        let textcat = trained();
        let docs = [
            Document::from_words(&["great", "movie"]),
            Document::from_words(&["awful"]),
            Document::default(),
        ];
        let scores = textcat.predict(&docs).unwrap();
        assert_eq!(scores.rows(), 3);
        assert_eq!(scores.cols(), 2);
    }

    #[test]
    fn test_annotations_add_only() {
        let textcat = trained();
        let mut docs = [Document::from_words(&["great", "fun", "movie"])];
        docs[0].cats.insert("POSITIVE".into(), 0.123);
        let scores = textcat.predict(&docs).unwrap();
        textcat.set_annotations(&mut docs, &scores);
        // Pre-set value kept; missing label filled in.
        assert!((docs[0].cats["POSITIVE"] - 0.123).abs() < 1e-6);
        assert!(docs[0].cats.contains_key("NEGATIVE"));
    }

    #[test]
    fn test_missing_labels_masked_from_loss() {
        let mut textcat = TextCategorizer::new("textcat");
        textcat.begin_training(&examples(), None).unwrap();
        let partial = [Example::new(Document::from_words(&["meh"]))
            .with_cats(cats(&[("POSITIVE", 1.0)]))];
        let docs = [partial[0].doc.clone()];
        let scores = textcat.predict(&docs).unwrap();
        let (d_scores, _) = textcat.get_loss(&partial, &scores).unwrap();
        let negative_col = textcat.labels().id_of("NEGATIVE").unwrap();
        assert_eq!(d_scores.row(0)[negative_col], 0.0);
    }

    #[test]
    fn test_loss_normalized_by_batch_size() {
        let mut textcat = TextCategorizer::new("textcat");
        let batch = examples();
        textcat.begin_training(&batch, None).unwrap();
        // Zero-initialized logistic model scores 0.5 everywhere; each of the
        // two examples contributes 0.25 + 0.25 of squared error, so the mean
        // over the batch is (0.5 + 0.5) / 2.
        let docs: Vec<Document> = batch.iter().map(|e| e.doc.clone()).collect();
        let scores = textcat.predict(&docs).unwrap();
        let (d_scores, loss) = textcat.get_loss(&batch, &scores).unwrap();
        assert!((loss - 0.5).abs() < 1e-5);
        for i in 0..d_scores.rows() {
            for &d in d_scores.row(i) {
                assert!((d.abs() - 0.25).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_loss_shape_checked() {
        let textcat = trained();
        let scores = ScoreMatrix::zeros(3, 2);
        assert!(matches!(
            textcat.get_loss(&examples(), &scores),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_training_separates_classes() {
        let textcat = trained();
        let docs = [
            Document::from_words(&["great", "fun", "movie"]),
            Document::from_words(&["boring", "awful", "mess"]),
        ];
        let scores = textcat.predict(&docs).unwrap();
        let pos = textcat.labels().id_of("POSITIVE").unwrap();
        let neg = textcat.labels().id_of("NEGATIVE").unwrap();
        assert!(scores.row(0)[pos] > scores.row(0)[neg]);
        assert!(scores.row(1)[neg] > scores.row(1)[pos]);
    }

    #[test]
    fn test_add_label_post_build_fails_and_preserves_labels() {
        let mut textcat = trained();
        let before = textcat.labels().len();
        assert!(matches!(
            textcat.add_label("NEUTRAL"),
            Err(Error::ModelAlreadyShaped(_))
        ));
        assert_eq!(textcat.labels().len(), before);
    }

    #[test]
    fn test_persist_roundtrip() {
        let textcat = trained();
        let bytes = textcat.to_component_bytes(&[]).unwrap();
        let mut restored = TextCategorizer::new("textcat");
        restored.from_component_bytes(&bytes, &[]).unwrap();
        let docs = [Document::from_words(&["great", "movie"])];
        assert_eq!(
            textcat.predict(&docs).unwrap(),
            restored.predict(&docs).unwrap()
        );
    }
}
