//! The uniform pipeline-component contract.
//!
//! Instead of an inheritance chain, components compose small capability
//! traits:
//!
//! - [`Scorable`] — batch-predict scores for documents (pure).
//! - [`Annotatable`] — write predictions into documents, add-only.
//! - [`Trainable`] — update/rehearse/label management.
//! - [`Pipe`] — object-safe umbrella so heterogeneous components can be
//!   chained in a [`Pipeline`].
//!
//! Shared default behavior (batched token scoring, label-alignment loss)
//! lives here as free functions parameterized over the capability traits
//! rather than as inherited methods.

use std::collections::HashMap;

use crate::doc::{encode_tokens, Document, Example};
use crate::error::{Error, Result};
use crate::model::{Optimizer, ScoreMatrix, ScoredModel};

/// Batch-predict scores for a slice of documents.
///
/// Pure with respect to the documents: prediction never mutates them.
pub trait Scorable {
    /// Component-specific score representation.
    type Scores;

    /// Score a batch of documents.
    ///
    /// # Errors
    /// Fails with [`Error::ModelNotReady`] if the component's model has not
    /// been built.
    fn predict(&self, docs: &[Document]) -> Result<Self::Scores>;
}

/// Write predicted scores into documents.
pub trait Annotatable: Scorable {
    /// Annotate documents with previously predicted scores.
    ///
    /// This is the only mutator of documents, and it is add-only: any field
    /// already meaningfully set is left untouched, so components compose
    /// without clobbering earlier hand-authored or predicted annotations.
    fn set_annotations(&self, docs: &mut [Document], scores: &Self::Scores);
}

/// Incremental training over (document, gold) pairs.
pub trait Trainable {
    /// Component name, used as the loss key.
    fn name(&self) -> &str;

    /// Run one update step over a batch of examples.
    ///
    /// Skips entirely (a no-op, not an error) when every document in the
    /// batch is empty. Otherwise: forward pass with dropout, loss/gradient,
    /// backprop, and — when an optimizer is supplied — a parameter update.
    /// The scalar loss is accumulated into `losses` keyed by component name.
    fn update(
        &mut self,
        examples: &[Example],
        dropout: f32,
        sgd: Option<&mut dyn Optimizer>,
        losses: &mut HashMap<String, f32>,
    ) -> Result<()>;

    /// Anti-forgetting step: score the examples with a frozen snapshot of
    /// the pre-update model and penalize the live model's divergence from it
    /// with a squared-error gradient. A no-op when no snapshot was captured.
    fn rehearse(
        &mut self,
        _examples: &[Example],
        _sgd: Option<&mut dyn Optimizer>,
        _losses: &mut HashMap<String, f32>,
    ) -> Result<()> {
        Ok(())
    }

    /// Scan training data to populate label sets, then build the model if it
    /// is not already built. Returns a ready-to-use optimizer, constructing
    /// the default when the caller supplies none.
    fn begin_training(
        &mut self,
        examples: &[Example],
        sgd: Option<Box<dyn Optimizer>>,
    ) -> Result<Box<dyn Optimizer>>;

    /// Add a label, returning `0` if it was already present and `1` if newly
    /// added.
    ///
    /// # Errors
    /// [`Error::InvalidLabel`] for unusable labels; [`Error::ModelAlreadyShaped`]
    /// when the model is instantiated and its output layer cannot grow.
    fn add_label(&mut self, label: &str) -> Result<usize>;
}

/// Object-safe component handle for pipeline composition.
pub trait Pipe {
    /// Component name.
    fn name(&self) -> &str;

    /// Predict and annotate a batch of documents in one step.
    fn apply(&self, docs: &mut [Document]) -> Result<()>;
}

/// A sequence of components applied to batched document streams.
///
/// Processing is synchronous and single-threaded per batch: documents are
/// grouped into fixed-size batches, each batch is scored as one tensor
/// operation per component, then annotated sequentially. Annotation writes
/// are per-document atomic: a document is either fully annotated for a given
/// component or not processed at all.
pub struct Pipeline {
    components: Vec<Box<dyn Pipe>>,
    batch_size: usize,
}

impl Pipeline {
    /// Create an empty pipeline with the given batch size (minimum 1).
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            components: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append a component.
    pub fn add(&mut self, component: Box<dyn Pipe>) {
        self.components.push(component);
    }

    /// Names of the components, in application order.
    #[must_use]
    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Run every component over the documents, batch by batch.
    ///
    /// A caller aborting mid-stream simply stops feeding batches; documents
    /// processed so far remain in their last-written consistent state.
    pub fn process(&self, docs: &mut [Document]) -> Result<()> {
        for batch in docs.chunks_mut(self.batch_size) {
            for component in &self.components {
                component.apply(batch)?;
            }
        }
        Ok(())
    }
}

/// Group items into fixed-size batches, preserving order.
#[must_use]
pub fn minibatch<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// =============================================================================
// Shared sequence-labeling machinery
// =============================================================================

/// Score all tokens of a document batch as one model call, returning one
/// matrix per document.
///
/// Batches where every document is empty short-circuit to correctly-shaped
/// empty matrices without invoking the model at all, avoiding degenerate
/// zero-length tensor operations.
pub(crate) fn score_token_batch(
    model: &dyn ScoredModel,
    docs: &[Document],
) -> Result<Vec<ScoreMatrix>> {
    let lengths: Vec<usize> = docs.iter().map(Document::len).collect();
    if lengths.iter().all(|&len| len == 0) {
        return Ok(docs
            .iter()
            .map(|_| ScoreMatrix::zeros(0, model.output_width()))
            .collect());
    }
    let inputs = batch_inputs(docs, model.input_width())?;
    let scores = model.predict(&inputs)?;
    if scores.rows() != inputs.rows() {
        return Err(Error::shape_mismatch(inputs.rows(), scores.rows()));
    }
    scores.split(&lengths)
}

/// Stack the token encodings of a document batch into one input matrix.
pub(crate) fn batch_inputs(docs: &[Document], width: usize) -> Result<ScoreMatrix> {
    let encoded: Vec<ScoreMatrix> = docs.iter().map(|d| encode_tokens(d, width)).collect();
    ScoreMatrix::vstack(&encoded, width)
}

/// Loss and gradient for one batch.
pub(crate) struct BatchLoss {
    /// Gradient with respect to the scores, aligned row-for-row.
    pub d_scores: ScoreMatrix,
    /// Summed scalar loss.
    pub loss: f32,
}

/// Label-alignment squared-error loss over flattened score rows.
///
/// `gold_ids` is aligned one-to-one with the score rows. Positions with no
/// aligned gold label default to the model's own current guess (so the
/// one-hot target equals the arg-max prediction) and are masked to zero
/// gradient: a self-training fallback that contributes nothing to the loss
/// rather than raising.
///
/// # Errors
/// [`Error::ShapeMismatch`] when gold and score rows diverge — never
/// swallowed, since a silent mismatch would corrupt gradients.
pub(crate) fn sequence_loss(
    scores: &ScoreMatrix,
    gold_ids: &[Option<usize>],
) -> Result<BatchLoss> {
    if gold_ids.len() != scores.rows() {
        return Err(Error::shape_mismatch(scores.rows(), gold_ids.len()));
    }
    let mut d_scores = ScoreMatrix::zeros(scores.rows(), scores.cols());
    let mut loss = 0.0;
    for i in 0..scores.rows() {
        let row = scores.row(i);
        let (target, known) = match gold_ids[i] {
            Some(id) => (id, true),
            None => (crate::model::argmax(row), false),
        };
        if !known {
            continue; // masked: zero gradient, zero loss
        }
        let d_row = d_scores.row_mut(i);
        for (j, (&score, d)) in row.iter().zip(d_row.iter_mut()).enumerate() {
            let truth = if j == target { 1.0 } else { 0.0 };
            *d = score - truth;
            loss += *d * *d;
        }
    }
    Ok(BatchLoss { d_scores, loss })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailingModel;

    #[test]
    fn test_minibatch_sizes() {
        let batches = minibatch((0..7).collect(), 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![0, 1, 2]);
        assert_eq!(batches[2], vec![6]);
    }

    #[test]
    fn test_minibatch_zero_size_clamped() {
        let batches = minibatch(vec![1, 2], 0);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_empty_batch_never_invokes_model() {
        let model = FailingModel::new(8, 3);
        let docs = vec![Document::default(), Document::default()];
        let scored = score_token_batch(&model, &docs).unwrap();
        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].rows(), 0);
        assert_eq!(scored[0].cols(), 3);
    }

    #[test]
    fn test_sequence_loss_masks_unknown_rows() {
        let scores = ScoreMatrix::from_rows(
            vec![vec![0.2, 0.5, 0.3], vec![0.9, 0.05, 0.05]],
            3,
        )
        .unwrap();
        let loss = sequence_loss(&scores, &[Some(1), None]).unwrap();
        // Second row is unknown gold: gradient must be all zeros.
        assert!(loss.d_scores.row(1).iter().all(|&v| v == 0.0));
        // First row pushes toward one-hot on label 1.
        assert!(loss.d_scores.row(0)[1] < 0.0);
        assert!(loss.d_scores.row(0)[0] > 0.0);
        assert!(loss.loss > 0.0);
    }

    #[test]
    fn test_sequence_loss_shape_checked() {
        let scores = ScoreMatrix::zeros(2, 3);
        assert!(matches!(
            sequence_loss(&scores, &[Some(0)]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_sequence_loss_perfect_prediction_zero() {
        let scores =
            ScoreMatrix::from_rows(vec![vec![0.0, 1.0, 0.0]], 3).unwrap();
        let loss = sequence_loss(&scores, &[Some(1)]).unwrap();
        assert_eq!(loss.loss, 0.0);
    }
}
