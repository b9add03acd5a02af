//! Entity disambiguation against a knowledge base.
//!
//! Recognized entity mentions are resolved to knowledge-base identifiers by
//! combining each candidate's corpus prior with the similarity between the
//! candidate's pretrained entity embedding and an encoding of the mention's
//! sentence context. Mentions that cannot be resolved receive the sentinel
//! [`NIL_LINK`], which is an explicit "no link" answer, not an error.

use std::collections::{BTreeSet, HashMap};

use rand::seq::SliceRandom;
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
    excluded, ComponentArchive, Persist, SECTION_CFG, SECTION_KB, SECTION_LABELS, SECTION_MODEL,
};
use crate::similarity::{cosine, cosine_distance, cosine_distance_gradient};

/// Sentinel knowledge-base identifier for "no link".
pub const NIL_LINK: &str = "NIL";

// =============================================================================
// Knowledge base
// =============================================================================

/// One candidate entity for a mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Knowledge-base identifier.
    pub entity_id: String,
    /// Prior probability of this entity given the mention text.
    pub prior: f32,
    /// Pretrained entity embedding.
    pub vector: Vec<f32>,
}

/// Candidate lookup and entity embeddings.
///
/// The knowledge base is an external collaborator: the disambiguator queries
/// it but never mutates it, and after deserialization the caller re-attaches
/// it before loading model parameters (the model's output width is the KB's
/// embedding width).
pub trait KnowledgeBase {
    /// Candidate entities for a mention's surface text.
    fn get_candidates(&self, mention: &str) -> Vec<Candidate>;

    /// Embedding of a known entity.
    fn get_vector(&self, entity_id: &str) -> Option<Vec<f32>>;

    /// Width of the entity embeddings.
    fn entity_vector_length(&self) -> usize;

    /// Serialized form for persistence, when the implementation supports it.
    fn to_kb_bytes(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A simple serializable in-memory knowledge base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryKb {
    vector_length: usize,
    vectors: HashMap<String, Vec<f32>>,
    aliases: HashMap<String, Vec<(String, f32)>>,
}

impl InMemoryKb {
    /// Create an empty knowledge base with the given embedding width.
    #[must_use]
    pub fn new(vector_length: usize) -> Self {
        Self {
            vector_length,
            vectors: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register an entity and its embedding.
    pub fn add_entity(&mut self, entity_id: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.vector_length {
            return Err(Error::shape_mismatch(self.vector_length, vector.len()));
        }
        self.vectors.insert(entity_id.into(), vector);
        Ok(())
    }

    /// Register a mention alias with (entity id, prior) pairs.
    pub fn add_alias(&mut self, mention: impl Into<String>, entries: Vec<(String, f32)>) {
        self.aliases.insert(mention.into(), entries);
    }

    /// Restore a knowledge base persisted by [`KnowledgeBase::to_kb_bytes`].
    pub fn from_kb_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl KnowledgeBase for InMemoryKb {
    fn get_candidates(&self, mention: &str) -> Vec<Candidate> {
        let Some(entries) = self.aliases.get(mention) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|(entity_id, prior)| {
                self.vectors.get(entity_id).map(|vector| Candidate {
                    entity_id: entity_id.clone(),
                    prior: *prior,
                    vector: vector.clone(),
                })
            })
            .collect()
    }

    fn get_vector(&self, entity_id: &str) -> Option<Vec<f32>> {
        self.vectors.get(entity_id).cloned()
    }

    fn entity_vector_length(&self) -> usize {
        self.vector_length
    }

    fn to_kb_bytes(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(self).ok()
    }
}

// =============================================================================
// The disambiguator
// =============================================================================

/// Disambiguator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLinkerConfig {
    /// Width of the hashed sentence-context input rows.
    pub token_vector_width: usize,
    /// Whether candidate priors participate in scoring.
    pub incl_prior: bool,
    /// Entity type labels that are never linked (always [`NIL_LINK`]).
    pub discard_types: BTreeSet<String>,
}

impl Default for EntityLinkerConfig {
    fn default() -> Self {
        Self {
            token_vector_width: 64,
            incl_prior: true,
            discard_types: BTreeSet::new(),
        }
    }
}

/// Entity disambiguator.
///
/// The context model maps a sentence encoding into the knowledge base's
/// embedding space; candidates are ranked by `prior + sim - prior * sim`.
/// The similarity function is injectable so tests can observe whether it is
/// consulted at all (single-candidate mentions skip it entirely).
pub struct EntityLinker {
    name: String,
    cfg: EntityLinkerConfig,
    labels: LabelSet,
    model: ModelSlot,
    kb: Option<Box<dyn KnowledgeBase>>,
    similarity: fn(&[f32], &[f32]) -> f32,
}

impl EntityLinker {
    /// Create a disambiguator with no knowledge base attached.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: EntityLinkerConfig::default(),
            labels: LabelSet::new(),
            model: ModelSlot::Uninitialized,
            kb: None,
            similarity: cosine,
        }
    }

    /// Attach the knowledge base.
    pub fn set_kb(&mut self, kb: Box<dyn KnowledgeBase>) {
        self.kb = Some(kb);
    }

    /// Replace the candidate similarity function.
    pub fn set_similarity(&mut self, similarity: fn(&[f32], &[f32]) -> f32) {
        self.similarity = similarity;
    }

    /// Mutable access to the configuration (before training).
    pub fn cfg_mut(&mut self) -> &mut EntityLinkerConfig {
        &mut self.cfg
    }

    /// Knowledge-base identifiers seen during training.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Install a context model directly (tests and custom architectures).
    pub fn set_model(&mut self, model: Box<dyn ScoredModel>) {
        self.model.set(model);
    }

    /// Whether the context model has been built.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    fn kb(&self) -> Result<&dyn KnowledgeBase> {
        self.kb
            .as_deref()
            .ok_or_else(|| Error::missing_knowledge_base(&self.name))
    }

    fn mention_text(doc: &Document, start: usize, end: usize) -> String {
        doc.tokens[start..end]
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Context encoding of the sentence containing `token_idx`, computed at
    /// most once per sentence per document.
    fn sentence_context(
        &self,
        model: &dyn ScoredModel,
        doc: &Document,
        token_idx: usize,
        cache: &mut HashMap<usize, Vec<f32>>,
    ) -> Result<Vec<f32>> {
        let sent_idx = doc.sentence_of(token_idx).unwrap_or(0);
        if let Some(ctx) = cache.get(&sent_idx) {
            return Ok(ctx.clone());
        }
        let range = doc
            .sentences()
            .get(sent_idx)
            .cloned()
            .unwrap_or(0..doc.len());
        let input = ScoreMatrix::from_rows(
            vec![encode_span(doc, range, self.cfg.token_vector_width)],
            self.cfg.token_vector_width,
        )?;
        let out = model.predict(&input)?;
        let ctx = out.row(0).to_vec();
        cache.insert(sent_idx, ctx.clone());
        Ok(ctx)
    }

    /// Resolve one mention to a KB id.
    fn resolve(
        &self,
        model: &dyn ScoredModel,
        doc: &Document,
        start: usize,
        end: usize,
        label: &str,
        cache: &mut HashMap<usize, Vec<f32>>,
    ) -> Result<String> {
        // Span fields are public: a malformed mention is unlinkable, not a
        // panic.
        if start >= end || end > doc.len() {
            return Ok(NIL_LINK.to_string());
        }
        if self.cfg.discard_types.contains(label) {
            return Ok(NIL_LINK.to_string());
        }
        let mention = Self::mention_text(doc, start, end);
        let mut candidates = self.kb()?.get_candidates(&mention);
        match candidates.len() {
            0 => Ok(NIL_LINK.to_string()),
            // One candidate: take it without consulting context similarity.
            1 => Ok(candidates.remove(0).entity_id),
            _ => {
                let context = self.sentence_context(model, doc, start, cache)?;
                // Shuffle so ties do not systematically favor KB order.
                candidates.shuffle(&mut rand::thread_rng());
                let mut best: Option<(f32, &Candidate)> = None;
                for candidate in &candidates {
                    let prior = if self.cfg.incl_prior {
                        candidate.prior
                    } else {
                        0.0
                    };
                    let sim = (self.similarity)(&context, &candidate.vector);
                    let score = prior + sim - prior * sim;
                    if best.map_or(true, |(b, _)| score > b) {
                        best = Some((score, candidate));
                    }
                }
                Ok(best
                    .map(|(_, c)| c.entity_id.clone())
                    .unwrap_or_else(|| NIL_LINK.to_string()))
            }
        }
    }

    /// Gather the training rows for a batch: one (sentence encoding, gold
    /// entity vector) pair per positively-linked mention.
    fn training_rows(&self, examples: &[Example]) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>)> {
        let kb = self.kb()?;
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for example in examples {
            for (&(start, end), links) in &example.gold.links {
                let matched = example
                    .doc
                    .ents
                    .iter()
                    .any(|e| e.start == start && e.end == end);
                if !matched {
                    return Err(Error::gold_alignment(format!(
                        "gold link span ({start}, {end}) has no matching entity mention"
                    )));
                }
                for (kb_id, &truth) in links {
                    if !truth {
                        continue; // only positive links carry gradient
                    }
                    let Some(target) = kb.get_vector(kb_id) else {
                        return Err(Error::gold_alignment(format!(
                            "gold link {kb_id:?} is not in the knowledge base"
                        )));
                    };
                    let sent_idx = example.doc.sentence_of(start).unwrap_or(0);
                    let range = example
                        .doc
                        .sentences()
                        .get(sent_idx)
                        .cloned()
                        .unwrap_or(0..example.doc.len());
                    inputs.push(encode_span(&example.doc, range, self.cfg.token_vector_width));
                    targets.push(target);
                }
            }
        }
        Ok((inputs, targets))
    }
}

impl Scorable for EntityLinker {
    /// One predicted KB id per entity mention, per document.
    type Scores = Vec<Vec<String>>;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        self.kb()?;
        let model = self.model.get(&self.name)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut cache = HashMap::new();
            let mut links = Vec::with_capacity(doc.ents.len());
            for ent in &doc.ents {
                links.push(self.resolve(model, doc, ent.start, ent.end, &ent.label, &mut cache)?);
            }
            out.push(links);
        }
        Ok(out)
    }
}

impl Annotatable for EntityLinker {
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores) {
        for (doc, links) in docs.iter_mut().zip(scores) {
            for (i, kb_id) in links.iter().enumerate() {
                let Some(ent) = doc.ents.get_mut(i) else {
                    break;
                };
                if ent.kb_id.is_none() {
                    ent.kb_id = Some(kb_id.clone());
                }
                let end = ent.end.min(doc.tokens.len());
                let start = ent.start.min(end);
                for token in &mut doc.tokens[start..end] {
                    if token.ent_kb_id.is_none() {
                        token.ent_kb_id = Some(kb_id.clone());
                    }
                }
            }
        }
    }
}

impl Trainable for EntityLinker {
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
        let (inputs, targets) = self.training_rows(examples)?;
        if inputs.is_empty() {
            return Ok(());
        }
        let inputs = ScoreMatrix::from_rows(inputs, self.cfg.token_vector_width)?;
        let model = self.model.get_mut(&self.name)?;
        model.set_dropout(dropout);
        let predictions = model.begin_update(&inputs)?;
        if predictions.rows() != targets.len() {
            return Err(Error::shape_mismatch(targets.len(), predictions.rows()));
        }
        let mut d_scores = ScoreMatrix::zeros(predictions.rows(), predictions.cols());
        let mut loss = 0.0;
        for (i, target) in targets.iter().enumerate() {
            if target.len() != predictions.cols() {
                return Err(Error::shape_mismatch(predictions.cols(), target.len()));
            }
            let pred = predictions.row(i);
            loss += cosine_distance(pred, target);
            let grad = cosine_distance_gradient(pred, target);
            d_scores.row_mut(i).copy_from_slice(&grad);
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
        let width = self.kb()?.entity_vector_length();
        for example in examples {
            let ids: Vec<String> = example
                .gold
                .links
                .values()
                .flat_map(|links| {
                    links
                        .iter()
                        .filter(|(_, &truth)| truth)
                        .map(|(id, _)| id.clone())
                })
                .collect();
            for id in ids {
                self.add_label(&id)?;
            }
        }
        if !self.model.is_ready() {
            debug!(
                component = %self.name,
                embedding_width = width,
                "building entity disambiguation context model"
            );
            self.model.set(Box::new(LinearModel::new(
                self.cfg.token_vector_width,
                width,
                Activation::Identity,
            )));
        }
        Ok(sgd.unwrap_or_else(|| Box::new(SgdOptimizer::default()) as Box<dyn Optimizer>))
    }

    /// Record a KB id seen in training. The context model's output width is
    /// the embedding width, not the label count, so labels never reshape it.
    fn add_label(&mut self, label: &str) -> Result<usize> {
        if label.trim().is_empty() {
            return Err(Error::invalid_label("KB id must be a non-empty string"));
        }
        if self.labels.contains(label) {
            return Ok(0);
        }
        self.labels.add(label)?;
        Ok(1)
    }
}

impl Pipe for EntityLinker {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, docs: &mut [Document]) -> Result<()> {
        let scores = self.predict(docs)?;
        self.set_annotations(docs, &scores);
        Ok(())
    }
}

impl Persist for EntityLinker {
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive> {
        let mut archive = ComponentArchive::new();
        if !excluded(SECTION_CFG, exclude) {
            archive.put_json(SECTION_CFG, &self.cfg)?;
        }
        if !excluded(SECTION_LABELS, exclude) {
            archive.put_json(SECTION_LABELS, &self.labels)?;
        }
        if !excluded(SECTION_KB, exclude) {
            if let Some(bytes) = self.kb.as_deref().and_then(KnowledgeBase::to_kb_bytes) {
                archive.put_bytes(SECTION_KB, bytes);
            }
        }
        if !excluded(SECTION_MODEL, exclude) {
            if let ModelSlot::Ready(model) = &self.model {
                archive.put_bytes(SECTION_MODEL, model.to_bytes()?);
            }
        }
        Ok(archive)
    }

    /// The knowledge base must be re-attached before restoring: the model's
    /// output width comes from the KB's embedding width. A persisted
    /// [`InMemoryKb`] section can be restored with
    /// [`InMemoryKb::from_kb_bytes`] and attached via [`EntityLinker::set_kb`]
    /// first.
    fn from_archive(&mut self, archive: &ComponentArchive, exclude: &[&str]) -> Result<()> {
        if !excluded(SECTION_CFG, exclude) {
            if let Some(cfg) = archive.get_json::<EntityLinkerConfig>(SECTION_CFG)? {
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
                let width = self.kb()?.entity_vector_length();
                let mut model = LinearModel::new(
                    self.cfg.token_vector_width,
                    width,
                    Activation::Identity,
                );
                model.load_bytes(bytes)?;
                self.model.set(Box::new(model));
            }
        }
        Ok(())
    }
}
