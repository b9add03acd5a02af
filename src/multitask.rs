//! Auxiliary multitask objectives.
//!
//! A [`MultitaskObjective`] is a sequence labeler over labels *derived* from
//! gold annotations rather than annotated directly: dependency label plus
//! head offset, entity type, or a BILU sentence-boundary scheme computed
//! from the gold dependency heads. The target is a closed enum selected at
//! construction; unknown target names are rejected there, not at first use.
//!
//! Multitask objectives write no annotations. They exist to shape a model's
//! representation during training.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{sequence_loss, Annotatable, Pipe, Scorable, Trainable};
use crate::doc::{encode_tokens, Document, Example};
use crate::error::{Error, Result};
use crate::labels::LabelSet;
use crate::model::{
    Activation, LinearModel, ModelSlot, Optimizer, ScoreMatrix, ScoredModel, SgdOptimizer,
};
use crate::serialize::{
    excluded, ComponentArchive, Persist, SECTION_CFG, SECTION_LABELS, SECTION_MODEL,
};

/// The auxiliary prediction target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuxTarget {
    /// Dependency label combined with the signed head offset.
    DepLabelOffset,
    /// Gold entity type of each token.
    EntityType,
    /// Begin/Inside/Last/Unit sentence-boundary tags derived from gold
    /// dependency heads.
    SentenceBilu,
}

impl AuxTarget {
    /// Parse a target name, rejecting unknown names at construction time.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "dep_label_offset" => Ok(AuxTarget::DepLabelOffset),
            "ent_type" => Ok(AuxTarget::EntityType),
            "sent_bilu" => Ok(AuxTarget::SentenceBilu),
            other => Err(Error::invalid_label(format!(
                "unknown multitask target {other:?}"
            ))),
        }
    }
}

/// Multitask-objective configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultitaskConfig {
    /// Width of the hashed token-feature input rows.
    pub token_vector_width: usize,
    /// The derivation target.
    pub target: AuxTarget,
}

/// An auxiliary training objective over derived token labels.
pub struct MultitaskObjective {
    name: String,
    cfg: MultitaskConfig,
    labels: LabelSet,
    model: ModelSlot,
}

/// Per-batch memo of root assignments, keyed by example index within the
/// batch and discarded when the batch ends. Replaces a single-slot
/// identity-keyed cache whose eviction behavior was an accident of call
/// order.
struct RootMemo {
    roots: HashMap<usize, Vec<usize>>,
}

impl RootMemo {
    fn new() -> Self {
        Self {
            roots: HashMap::new(),
        }
    }

    fn roots_for<'a>(&'a mut self, example_idx: usize, heads: &[Option<usize>]) -> &'a [usize] {
        self.roots
            .entry(example_idx)
            .or_insert_with(|| (0..heads.len()).map(|i| token_root(heads, i)).collect())
    }
}

/// Syntactic root of token `i`: follow head pointers until a token heads
/// itself or has no head. Cycle-safe via a seen-set; a cycle resolves to the
/// first revisited token.
fn token_root(heads: &[Option<usize>], i: usize) -> usize {
    let mut seen = HashSet::new();
    let mut current = i;
    loop {
        if !seen.insert(current) {
            return current;
        }
        match heads.get(current).copied().flatten() {
            Some(head) if head != current && head < heads.len() => current = head,
            _ => return current,
        }
    }
}

/// Derive BILU sentence tags by grouping contiguous runs of tokens that
/// share a root.
fn sentence_bilu_tags(roots: &[usize]) -> Vec<String> {
    let mut tags = Vec::with_capacity(roots.len());
    let mut start = 0;
    while start < roots.len() {
        let mut end = start + 1;
        while end < roots.len() && roots[end] == roots[start] {
            end += 1;
        }
        if end - start == 1 {
            tags.push("U-SENT".to_string());
        } else {
            tags.push("B-SENT".to_string());
            for _ in start + 1..end - 1 {
                tags.push("I-SENT".to_string());
            }
            tags.push("L-SENT".to_string());
        }
        start = end;
    }
    tags
}

impl MultitaskObjective {
    /// Create an objective for the given target.
    #[must_use]
    pub fn new(name: impl Into<String>, target: AuxTarget) -> Self {
        Self {
            name: name.into(),
            cfg: MultitaskConfig {
                token_vector_width: 64,
                target,
            },
            labels: LabelSet::new(),
            model: ModelSlot::Uninitialized,
        }
    }

    /// Create an objective from a target name, rejecting unknown names.
    pub fn from_target_name(name: impl Into<String>, target: &str) -> Result<Self> {
        Ok(Self::new(name, AuxTarget::from_name(target)?))
    }

    /// The derived-label set.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Derive the gold label for one token, if the gold annotations support
    /// the target at this position.
    fn derive_label(
        &self,
        memo: &mut RootMemo,
        example_idx: usize,
        example: &Example,
        token_idx: usize,
    ) -> Option<String> {
        match self.cfg.target {
            AuxTarget::DepLabelOffset => {
                let dep = example.gold.deps.get(token_idx)?.as_ref()?;
                let head = (*example.gold.heads.get(token_idx)?)?;
                let offset = head as isize - token_idx as isize;
                Some(format!("{dep}:{offset}"))
            }
            AuxTarget::EntityType => example.gold.ent_types.get(token_idx)?.clone(),
            AuxTarget::SentenceBilu => {
                if example.gold.heads.len() != example.doc.len() {
                    return None;
                }
                let roots = memo.roots_for(example_idx, &example.gold.heads);
                sentence_bilu_tags(roots).get(token_idx).cloned()
            }
        }
    }

    fn align_gold(&self, examples: &[Example]) -> Vec<Option<usize>> {
        let mut memo = RootMemo::new();
        let mut gold = Vec::new();
        for (idx, example) in examples.iter().enumerate() {
            for i in 0..example.doc.len() {
                let id = self
                    .derive_label(&mut memo, idx, example, i)
                    .and_then(|label| self.labels.id_of(&label));
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

impl Scorable for MultitaskObjective {
    type Scores = Vec<ScoreMatrix>;

    fn predict(&self, docs: &[Document]) -> Result<Self::Scores> {
        let model = self.model.get(&self.name)?;
        crate::component::score_token_batch(model, docs)
    }
}

impl Annotatable for MultitaskObjective {
    fn set_annotations(&self, _docs: &mut [Document], _scores: &Self::Scores) {
        // Auxiliary objectives write nothing; they only shape training.
    }
}

impl Trainable for MultitaskObjective {
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
        examples: &[Example],
        sgd: Option<Box<dyn Optimizer>>,
    ) -> Result<Box<dyn Optimizer>> {
        let mut memo = RootMemo::new();
        let mut derived = Vec::new();
        for (idx, example) in examples.iter().enumerate() {
            for i in 0..example.doc.len() {
                if let Some(label) = self.derive_label(&mut memo, idx, example, i) {
                    derived.push(label);
                }
            }
        }
        for label in derived {
            self.add_label(&label)?;
        }
        if !self.model.is_ready() {
            debug!(
                component = %self.name,
                target = ?self.cfg.target,
                labels = self.labels.len(),
                "building multitask model"
            );
            self.model.set(Box::new(LinearModel::new(
                self.cfg.token_vector_width,
                self.labels.len().max(1),
                Activation::Softmax,
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
                return Err(Error::model_already_shaped(format!(
                    "cannot add label {label:?} to {:?} after its model was built",
                    self.name
                )));
            }
        }
        self.labels.add(label)?;
        Ok(1)
    }
}

impl Pipe for MultitaskObjective {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _docs: &mut [Document]) -> Result<()> {
        // Nothing to annotate at inference time.
        Ok(())
    }
}

impl Persist for MultitaskObjective {
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
            if let Some(cfg) = archive.get_json::<MultitaskConfig>(SECTION_CFG)? {
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
    use crate::doc::GoldParse;

    fn heads_example(heads: Vec<Option<usize>>, n: usize) -> Example {
        let words: Vec<&str> = (0..n).map(|_| "w").collect();
        let mut example = Example::new(Document::from_words(&words));
        example.gold = GoldParse {
            heads,
            ..GoldParse::default()
        };
        example
    }

    #[test]
    fn test_target_names() {
        assert_eq!(
            AuxTarget::from_name("sent_bilu").unwrap(),
            AuxTarget::SentenceBilu
        );
        assert!(matches!(
            AuxTarget::from_name("nope"),
            Err(Error::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_token_root_follows_heads() {
        // 0 <- 1 <- 2, 3 roots itself
        let heads = vec![Some(0), Some(0), Some(1), Some(3)];
        assert_eq!(token_root(&heads, 2), 0);
        assert_eq!(token_root(&heads, 3), 3);
    }

    #[test]
    fn test_token_root_cycle_safe() {
        let heads = vec![Some(1), Some(0)];
        // Cycle 0 -> 1 -> 0 terminates.
        let root = token_root(&heads, 0);
        assert!(root == 0 || root == 1);
    }

    #[test]
    fn test_bilu_runs() {
        // Two sentences: tokens 0-2 rooted at 0, token 3 alone.
        assert_eq!(
            sentence_bilu_tags(&[0, 0, 0, 3]),
            vec!["B-SENT", "I-SENT", "L-SENT", "U-SENT"]
        );
        assert_eq!(sentence_bilu_tags(&[5, 5]), vec!["B-SENT", "L-SENT"]);
        assert!(sentence_bilu_tags(&[]).is_empty());
    }

    #[test]
    fn test_sentence_bilu_training() {
        let examples = vec![heads_example(
            vec![Some(0), Some(0), Some(0), Some(3)],
            4,
        )];
        let mut objective = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        objective.begin_training(&examples, None).unwrap();
        assert!(objective.labels().contains("B-SENT"));
        assert!(objective.labels().contains("U-SENT"));

        let mut losses = HashMap::new();
        objective.update(&examples, 0.0, None, &mut losses).unwrap();
        assert!(losses.contains_key("bilu"));
    }

    #[test]
    fn test_dep_label_offset_derivation() {
        let mut example = heads_example(vec![Some(1), Some(1)], 2);
        example.gold.deps = vec![Some("nsubj".into()), Some("ROOT".into())];
        let objective = MultitaskObjective::new("dep", AuxTarget::DepLabelOffset);
        let mut memo = RootMemo::new();
        assert_eq!(
            objective.derive_label(&mut memo, 0, &example, 0),
            Some("nsubj:1".to_string())
        );
        assert_eq!(
            objective.derive_label(&mut memo, 0, &example, 1),
            Some("ROOT:0".to_string())
        );
    }

    #[test]
    fn test_memo_is_per_example_not_single_slot() {
        let a = heads_example(vec![Some(0), Some(0)], 2);
        let b = heads_example(vec![Some(0), Some(1)], 2);
        let objective = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        let mut memo = RootMemo::new();
        // Interleaved queries across two examples must not evict each other.
        let a0 = objective.derive_label(&mut memo, 0, &a, 0);
        let b0 = objective.derive_label(&mut memo, 1, &b, 0);
        let a0_again = objective.derive_label(&mut memo, 0, &a, 0);
        assert_eq!(a0, a0_again);
        assert_eq!(b0, Some("U-SENT".to_string()));
        assert_eq!(memo.roots.len(), 2);
    }

    #[test]
    fn test_missing_heads_masked() {
        let example = Example::new(Document::from_words(&["a", "b"]));
        let objective = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        let gold = objective.align_gold(&[example]);
        assert_eq!(gold, vec![None, None]);
    }

    #[test]
    fn test_persist_roundtrip() {
        let examples = vec![heads_example(
            vec![Some(0), Some(0), Some(0), Some(3)],
            4,
        )];
        let mut objective = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        let mut sgd = objective.begin_training(&examples, None).unwrap();
        let mut losses = HashMap::new();
        objective
            .update(&examples, 0.0, Some(sgd.as_mut()), &mut losses)
            .unwrap();

        let bytes = objective.to_component_bytes(&[]).unwrap();
        let mut restored = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        restored.from_component_bytes(&bytes, &[]).unwrap();

        let docs = [Document::from_words(&["w", "w"])];
        assert_eq!(
            objective.predict(&docs).unwrap(),
            restored.predict(&docs).unwrap()
        );
    }

    #[test]
    fn test_add_label_post_build_fails() {
        let mut objective = MultitaskObjective::new("bilu", AuxTarget::SentenceBilu);
        objective
            .begin_training(&[heads_example(vec![Some(0)], 1)], None)
            .unwrap();
        assert!(matches!(
            objective.add_label("B-FRESH"),
            Err(Error::ModelAlreadyShaped(_))
        ));
    }
}
