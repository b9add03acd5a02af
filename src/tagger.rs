//! Part-of-speech tagger: batched per-token label scoring.
//!
//! The tagger scores every token in a batch with one model call, decodes
//! greedily by arg-max, and writes tags add-only. Its label set and the
//! morphological tag map grow together: adding a tag rebuilds the tag map as
//! an immutable snapshot, which is only possible before the model has been
//! instantiated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{sequence_loss, Annotatable, Pipe, Scorable, Trainable};
use crate::doc::{encode_tokens, Document, Example};
use crate::error::{Error, Result};
use crate::labels::{LabelSet, TagAttrs, TagMap};
use crate::model::{
    argmax_rows, Activation, LinearModel, ModelSlot, Optimizer, ScoreMatrix, ScoredModel,
    SgdOptimizer,
};
use crate::serialize::{
    excluded, ComponentArchive, Persist, SECTION_CFG, SECTION_LABELS, SECTION_MODEL,
    SECTION_TAG_MAP,
};

/// Coarse POS assigned to tags added without explicit attributes.
const DEFAULT_POS: &str = "X";

/// Tagger configuration. Persisted first so shape-dependent sections can
/// consult it on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggerConfig {
    /// Width of the hashed token-feature input rows.
    pub token_vector_width: usize,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            token_vector_width: 64,
        }
    }
}

/// Statistical part-of-speech tagger.
pub struct Tagger {
    name: String,
    cfg: TaggerConfig,
    labels: LabelSet,
    tag_map: TagMap,
    model: ModelSlot,
    rehearsal: Option<Box<dyn ScoredModel>>,
}

impl Tagger {
    /// Create an untrained tagger with default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, TaggerConfig::default())
    }

    /// Create an untrained tagger with explicit configuration.
    #[must_use]
    pub fn with_config(name: impl Into<String>, cfg: TaggerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            labels: LabelSet::new(),
            tag_map: TagMap::new(),
            model: ModelSlot::Uninitialized,
            rehearsal: None,
        }
    }

    /// The tagger's label set.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The tagger's tag map.
    #[must_use]
    pub fn tag_map(&self) -> &TagMap {
        &self.tag_map
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

    /// Add a tag with an explicit coarse POS. Returns `0` if already present,
    /// `1` if newly added.
    ///
    /// Adding a tag rebuilds the tag map snapshot, which cannot happen once
    /// the model is instantiated.
    pub fn add_tag(&mut self, tag: &str, pos: &str) -> Result<usize> {
        if tag.trim().is_empty() {
            return Err(Error::invalid_label("tag must be a non-empty string"));
        }
        if self.labels.contains(tag) {
            return Ok(0);
        }
        if let ModelSlot::Ready(model) = &self.model {
            if !model.resizable_output() {
                return Err(Error::model_already_shaped(format!(
                    "cannot add tag {tag:?} to {:?} after its model was built",
                    self.name
                )));
            }
        }
        self.labels.add(tag)?;
        self.tag_map = self.tag_map.with_entry(tag, TagAttrs { pos: pos.into() });
        Ok(1)
    }

    /// Capture a frozen snapshot of the current model as the rehearsal
    /// reference. Call when resuming training on new data to mitigate
    /// catastrophic forgetting of the original behavior.
    pub fn resume_training(&mut self) -> Result<()> {
        let model = self.model.get(&self.name)?;
        self.rehearsal = Some(model.clone_frozen());
        Ok(())
    }

    /// Gold tag ids aligned with the flattened token rows of a batch.
    fn align_gold(&self, examples: &[Example]) -> Vec<Option<usize>> {
        let mut gold = Vec::new();
        for example in examples {
            for i in 0..example.doc.len() {
                let id = example
                    .gold
                    .tags
                    .get(i)
                    .and_then(Option::as_ref)
                    .and_then(|tag| self.labels.id_of(tag));
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

impl Scorable for Tagger {
    type Scores = Vec<ScoreMatrix>;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        let model = self.model.get(&self.name)?;
        crate::component::score_token_batch(model, docs)
    }
}

impl Annotatable for Tagger {
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores) {
        for (doc, doc_scores) in docs.iter_mut().zip(scores) {
            let ids = argmax_rows(doc_scores);
            for (token, &id) in doc.tokens.iter_mut().zip(&ids) {
                if token.tag.is_some() {
                    continue;
                }
                let Some(tag) = self.labels.name_of(id) else {
                    continue;
                };
                token.tag = Some(tag.to_string());
                if token.pos.is_none() {
                    if let Some(pos) = self.tag_map.pos_of(tag) {
                        token.pos = Some(pos.to_string());
                    }
                }
                // A lemma equal to the default orthographic form carries no
                // information beyond the surface; drop it so downstream
                // lemmatization can fill the slot.
                let orth = token.orth_default();
                if token.lemma.as_deref() == Some(orth.as_str()) {
                    token.lemma = None;
                }
            }
        }
    }
}

impl Trainable for Tagger {
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
        let inputs = self.batch_inputs(examples)?;
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
            for tag in example.gold.tags.iter().flatten() {
                self.add_label(tag)?;
            }
        }
        if !self.model.is_ready() {
            debug!(
                component = %self.name,
                labels = self.labels.len(),
                "building tagger model"
            );
            let n_out = self.labels.len().max(1);
            self.model.set(Box::new(LinearModel::new(
                self.cfg.token_vector_width,
                n_out,
                Activation::Softmax,
            )));
        }
        Ok(sgd.unwrap_or_else(|| Box::new(SgdOptimizer::default()) as Box<dyn Optimizer>))
    }

    fn add_label(&mut self, label: &str) -> Result<usize> {
        self.add_tag(label, DEFAULT_POS)
    }
}

impl Pipe for Tagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, docs: &mut [Document]) -> Result<()> {
        let scores = self.predict(docs)?;
        self.set_annotations(docs, &scores);
        Ok(())
    }
}

impl Persist for Tagger {
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive> {
        let mut archive = ComponentArchive::new();
        if !excluded(SECTION_CFG, exclude) {
            archive.put_json(SECTION_CFG, &self.cfg)?;
        }
        if !excluded(SECTION_LABELS, exclude) {
            archive.put_json(SECTION_LABELS, &self.labels)?;
        }
        if !excluded(SECTION_TAG_MAP, exclude) {
            archive.put_json(SECTION_TAG_MAP, &self.tag_map)?;
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let ModelSlot::Ready(model) = &self.model {
                archive.put_bytes(SECTION_MODEL, model.to_bytes()?);
            }
        }
        Ok(archive)
    }

    fn from_archive(&mut self, archive: &ComponentArchive, exclude: &[&str]) -> Result<()> {
        // Config first: the label and model sections are shape-dependent.
        if !excluded(SECTION_CFG, exclude) {
            if let Some(cfg) = archive.get_json::<TaggerConfig>(SECTION_CFG)? {
                self.cfg = cfg;
            }
        }
        if !excluded(SECTION_LABELS, exclude) {
            if let Some(labels) = archive.get_json::<LabelSet>(SECTION_LABELS)? {
                self.labels = labels;
            }
        }
        if !excluded(SECTION_TAG_MAP, exclude) {
            if let Some(tag_map) = archive.get_json::<TagMap>(SECTION_TAG_MAP)? {
                self.tag_map = tag_map;
            }
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let Some(bytes) = archive.get_bytes(SECTION_MODEL) {
                let mut model = LinearModel::new(
                    self.cfg.token_vector_width,
                    self.labels.len().max(1),
                    Activation::Softmax,
                );
                model.load_bytes(bytes)?;
                self.model.set(Box::new(model));
            }
        }
        Ok(())
    }
}
