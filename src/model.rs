//! The trainable-model boundary.
//!
//! Components treat their scoring model as an opaque trainable function with
//! a `predict` / `begin_update` / `backprop` / `finish_update` contract. The
//! crate never inspects model internals beyond the [`ScoredModel`] trait plus
//! the declared input/output widths used for late-binding shapes.
//!
//! Forward and backward passes are separate trait methods rather than a
//! `begin_update -> (scores, backprop)` closure pairing: a backprop closure
//! cannot escape a `&mut self` borrow, so the model caches its forward pass
//! and `backprop` consumes the cached state.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Score matrix
// =============================================================================

/// A dense row-major matrix of scores.
///
/// Row count equals the number of scored units in the batch (tokens,
/// documents, or entity mentions); column count equals the label-set size or
/// embedding width. Any mismatch against a parallel gold array is a fatal
/// internal-consistency error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl ScoreMatrix {
    /// Create a zero-filled matrix.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from row vectors. All rows must share `cols` entries.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on ragged input.
    pub fn from_rows(rows: Vec<Vec<f32>>, cols: usize) -> Result<Self> {
        let mut data = Vec::with_capacity(rows.len() * cols);
        let n_rows = rows.len();
        for row in rows {
            if row.len() != cols {
                return Err(Error::shape_mismatch(cols, row.len()));
            }
            data.extend(row);
        }
        Ok(Self {
            rows: n_rows,
            cols,
            data,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Whether the matrix has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Borrow row `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Mutably borrow row `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Iterate over rows.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols.max(1))
    }

    /// Vertically stack matrices with identical column counts.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if column counts differ.
    pub fn vstack(parts: &[ScoreMatrix], cols: usize) -> Result<Self> {
        let mut out = ScoreMatrix::zeros(0, cols);
        for part in parts {
            if part.cols != cols {
                return Err(Error::shape_mismatch(cols, part.cols));
            }
            out.rows += part.rows;
            out.data.extend_from_slice(&part.data);
        }
        Ok(out)
    }

    /// Split into per-group matrices of `lengths[i]` rows each.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the lengths do not sum to the row
    /// count.
    pub fn split(&self, lengths: &[usize]) -> Result<Vec<ScoreMatrix>> {
        let total: usize = lengths.iter().sum();
        if total != self.rows {
            return Err(Error::shape_mismatch(self.rows, total));
        }
        let mut out = Vec::with_capacity(lengths.len());
        let mut offset = 0;
        for &len in lengths {
            let data = self.data[offset * self.cols..(offset + len) * self.cols].to_vec();
            out.push(Self {
                rows: len,
                cols: self.cols,
                data,
            });
            offset += len;
        }
        Ok(out)
    }

    /// Sum of squared entries.
    #[must_use]
    pub fn squared_sum(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}

/// Index of the maximum entry in a score row. Ties resolve to the first.
#[must_use]
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, &score) in row.iter().enumerate() {
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}

/// Arg-max decode every row of a score matrix.
#[must_use]
pub fn argmax_rows(scores: &ScoreMatrix) -> Vec<usize> {
    (0..scores.rows()).map(|i| argmax(scores.row(i))).collect()
}

// =============================================================================
// Optimizer boundary
// =============================================================================

/// Parameter-update strategy applied by `finish_update`.
pub trait Optimizer {
    /// Apply accumulated gradients to a named parameter, consuming (zeroing)
    /// the gradient buffer.
    fn update(&mut self, key: &str, weights: &mut [f32], grads: &mut [f32]);
}

/// Plain stochastic gradient descent, the default optimizer constructed by
/// `begin_training` when the caller supplies none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdOptimizer {
    /// Step size.
    pub learn_rate: f32,
}

impl Default for SgdOptimizer {
    fn default() -> Self {
        Self { learn_rate: 0.001 }
    }
}

impl Optimizer for SgdOptimizer {
    fn update(&mut self, _key: &str, weights: &mut [f32], grads: &mut [f32]) {
        for (w, g) in weights.iter_mut().zip(grads.iter_mut()) {
            *w -= self.learn_rate * *g;
            *g = 0.0;
        }
    }
}

// =============================================================================
// ScoredModel boundary
// =============================================================================

/// A trainable function mapping batched feature rows to score rows.
pub trait ScoredModel {
    /// Score a batch of inputs without touching training state.
    fn predict(&self, inputs: &ScoreMatrix) -> Result<ScoreMatrix>;

    /// Forward pass for training: scores the inputs (with dropout applied)
    /// and caches whatever `backprop` needs.
    fn begin_update(&mut self, inputs: &ScoreMatrix) -> Result<ScoreMatrix>;

    /// Accumulate the gradient of the loss with respect to the scores
    /// returned by the latest `begin_update`.
    fn backprop(&mut self, d_scores: &ScoreMatrix) -> Result<()>;

    /// Apply accumulated gradients through the optimizer and clear the
    /// cached forward state.
    fn finish_update(&mut self, optimizer: &mut dyn Optimizer) -> Result<()>;

    /// Set the dropout rate used by subsequent `begin_update` calls.
    fn set_dropout(&mut self, rate: f32);

    /// Expected input width.
    fn input_width(&self) -> usize;

    /// Output width (label-set size or embedding width).
    fn output_width(&self) -> usize;

    /// Whether the output layer can grow after construction. Simple ensemble
    /// output layers cannot; growing them in place would corrupt constituent
    /// sub-models.
    fn resizable_output(&self) -> bool {
        false
    }

    /// Serialize parameters to an opaque byte blob.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Load parameters from a byte blob produced by `to_bytes`.
    ///
    /// # Errors
    /// Returns [`Error::IncompatibleModelFormat`] if the blob does not match
    /// this model's shape.
    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Clone the current parameters into a frozen snapshot, used as the
    /// reference model for rehearsal updates.
    fn clone_frozen(&self) -> Box<dyn ScoredModel>;
}

/// Tri-state model readiness, collapsed into an explicit tagged union.
///
/// Entry points pattern-match and fail fast with [`Error::ModelNotReady`]
/// instead of testing sentinel values at call sites.
pub enum ModelSlot {
    /// No model built yet; architecture decisions are deferred until label
    /// sets are known.
    Uninitialized,
    /// A live model.
    Ready(Box<dyn ScoredModel>),
}

impl ModelSlot {
    /// Whether a model has been built.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelSlot::Ready(_))
    }

    /// Borrow the model or fail with [`Error::ModelNotReady`].
    pub fn get(&self, component: &str) -> Result<&dyn ScoredModel> {
        match self {
            ModelSlot::Ready(model) => Ok(model.as_ref()),
            ModelSlot::Uninitialized => Err(Error::model_not_ready(component)),
        }
    }

    /// Mutably borrow the model or fail with [`Error::ModelNotReady`].
    pub fn get_mut(&mut self, component: &str) -> Result<&mut (dyn ScoredModel + 'static)> {
        match self {
            ModelSlot::Ready(model) => Ok(model.as_mut()),
            ModelSlot::Uninitialized => Err(Error::model_not_ready(component)),
        }
    }

    /// Install a model.
    pub fn set(&mut self, model: Box<dyn ScoredModel>) {
        *self = ModelSlot::Ready(model);
    }
}

impl Default for ModelSlot {
    fn default() -> Self {
        ModelSlot::Uninitialized
    }
}

// =============================================================================
// Linear scorer
// =============================================================================

/// Output nonlinearity of the linear scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Row-wise softmax (mutually exclusive labels).
    Softmax,
    /// Element-wise logistic (independent multi-label scores).
    Logistic,
    /// Raw linear output (embedding-style outputs).
    Identity,
}

/// A single trainable linear layer with a configurable output activation.
///
/// This is the crate's built-in scorer: deliberately small, dependency-free
/// and deterministic, in the spirit of an always-available statistical
/// baseline. Heavier architectures plug in through [`ScoredModel`].
///
/// Training follows the squared-error-on-distribution convention: the
/// gradient handed to [`ScoredModel::backprop`] is taken with respect to the
/// activated outputs and applied directly at the linear layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    w: Vec<f32>,
    b: Vec<f32>,
    #[serde(skip)]
    dropout: f32,
    #[serde(skip)]
    grad_w: Vec<f32>,
    #[serde(skip)]
    grad_b: Vec<f32>,
    #[serde(skip)]
    cached_inputs: Option<ScoreMatrix>,
}

impl LinearModel {
    /// Create a zero-initialized linear scorer.
    #[must_use]
    pub fn new(n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            w: vec![0.0; n_in * n_out],
            b: vec![0.0; n_out],
            dropout: 0.0,
            grad_w: vec![0.0; n_in * n_out],
            grad_b: vec![0.0; n_out],
            cached_inputs: None,
        }
    }

    fn forward(&self, inputs: &ScoreMatrix) -> Result<ScoreMatrix> {
        if inputs.cols() != self.n_in {
            return Err(Error::shape_mismatch(self.n_in, inputs.cols()));
        }
        let mut out = ScoreMatrix::zeros(inputs.rows(), self.n_out);
        for i in 0..inputs.rows() {
            let x = inputs.row(i);
            let y = out.row_mut(i);
            for (j, y_j) in y.iter_mut().enumerate() {
                let w_row = &self.w[j * self.n_in..(j + 1) * self.n_in];
                *y_j = self.b[j] + w_row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
            }
            match self.activation {
                Activation::Softmax => softmax_in_place(y),
                Activation::Logistic => {
                    for v in y.iter_mut() {
                        *v = 1.0 / (1.0 + (-*v).exp());
                    }
                }
                Activation::Identity => {}
            }
        }
        Ok(out)
    }
}

fn softmax_in_place(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

impl ScoredModel for LinearModel {
    fn predict(&self, inputs: &ScoreMatrix) -> Result<ScoreMatrix> {
        self.forward(inputs)
    }

    fn begin_update(&mut self, inputs: &ScoreMatrix) -> Result<ScoreMatrix> {
        let mut dropped = inputs.clone();
        if self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            let mut rng = rand::thread_rng();
            for i in 0..dropped.rows() {
                for v in dropped.row_mut(i) {
                    if rng.gen::<f32>() < self.dropout {
                        *v = 0.0;
                    } else {
                        *v /= keep;
                    }
                }
            }
        }
        let scores = self.forward(&dropped)?;
        self.cached_inputs = Some(dropped);
        Ok(scores)
    }

    fn backprop(&mut self, d_scores: &ScoreMatrix) -> Result<()> {
        let inputs = self
            .cached_inputs
            .as_ref()
            .ok_or_else(|| Error::model_not_ready("backprop without begin_update"))?;
        if d_scores.rows() != inputs.rows() {
            return Err(Error::shape_mismatch(inputs.rows(), d_scores.rows()));
        }
        if d_scores.cols() != self.n_out {
            return Err(Error::shape_mismatch(self.n_out, d_scores.cols()));
        }
        if self.grad_w.len() != self.w.len() {
            self.grad_w = vec![0.0; self.w.len()];
            self.grad_b = vec![0.0; self.b.len()];
        }
        for i in 0..inputs.rows() {
            let x = inputs.row(i);
            let d = d_scores.row(i);
            for (j, &d_j) in d.iter().enumerate() {
                self.grad_b[j] += d_j;
                let g_row = &mut self.grad_w[j * self.n_in..(j + 1) * self.n_in];
                for (g, &x_k) in g_row.iter_mut().zip(x) {
                    *g += d_j * x_k;
                }
            }
        }
        Ok(())
    }

    fn finish_update(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        if self.grad_w.len() == self.w.len() {
            optimizer.update("W", &mut self.w, &mut self.grad_w);
            optimizer.update("b", &mut self.b, &mut self.grad_b);
        }
        self.cached_inputs = None;
        Ok(())
    }

    fn set_dropout(&mut self, rate: f32) {
        self.dropout = rate.clamp(0.0, 1.0);
    }

    fn input_width(&self) -> usize {
        self.n_in
    }

    fn output_width(&self) -> usize {
        self.n_out
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let loaded: LinearModel = serde_json::from_slice(bytes)
            .map_err(|e| Error::incompatible_model_format(e.to_string()))?;
        if loaded.n_in != self.n_in || loaded.n_out != self.n_out {
            return Err(Error::incompatible_model_format(format!(
                "expected {}x{} parameters, blob has {}x{}",
                self.n_out, self.n_in, loaded.n_out, loaded.n_in
            )));
        }
        if loaded.activation != self.activation {
            return Err(Error::incompatible_model_format(
                "activation mismatch between blob and model",
            ));
        }
        self.w = loaded.w;
        self.b = loaded.b;
        Ok(())
    }

    fn clone_frozen(&self) -> Box<dyn ScoredModel> {
        let mut frozen = self.clone();
        frozen.cached_inputs = None;
        frozen.grad_w = vec![0.0; frozen.w.len()];
        frozen.grad_b = vec![0.0; frozen.b.len()];
        frozen.dropout = 0.0;
        Box::new(frozen)
    }
}

// =============================================================================
// Test stub
// =============================================================================

/// A model stub that panics when scored.
///
/// Used to verify that empty-batch paths short-circuit without invoking the
/// underlying model. Provided in the library (not just tests) so downstream
/// crates can assert the same contract.
#[derive(Debug, Clone)]
pub struct FailingModel {
    n_in: usize,
    n_out: usize,
}

impl FailingModel {
    /// Create a stub with the given declared widths.
    #[must_use]
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self { n_in, n_out }
    }
}

impl ScoredModel for FailingModel {
    fn predict(&self, _inputs: &ScoreMatrix) -> Result<ScoreMatrix> {
        panic!("FailingModel::predict was invoked");
    }

    fn begin_update(&mut self, _inputs: &ScoreMatrix) -> Result<ScoreMatrix> {
        panic!("FailingModel::begin_update was invoked");
    }

    fn backprop(&mut self, _d_scores: &ScoreMatrix) -> Result<()> {
        panic!("FailingModel::backprop was invoked");
    }

    fn finish_update(&mut self, _optimizer: &mut dyn Optimizer) -> Result<()> {
        panic!("FailingModel::finish_update was invoked");
    }

    fn set_dropout(&mut self, _rate: f32) {}

    fn input_width(&self) -> usize {
        self.n_in
    }

    fn output_width(&self) -> usize {
        self.n_out
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn load_bytes(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(Error::incompatible_model_format(
            "FailingModel does not support byte loading",
        ))
    }

    fn clone_frozen(&self) -> Box<dyn ScoredModel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_ties_resolve_first() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[1.0]), 0);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = ScoreMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]], 2).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_vstack_split_roundtrip() {
        let a = ScoreMatrix::from_rows(vec![vec![1.0, 2.0]], 2).unwrap();
        let b = ScoreMatrix::from_rows(vec![vec![3.0, 4.0], vec![5.0, 6.0]], 2).unwrap();
        let stacked = ScoreMatrix::vstack(&[a.clone(), b.clone()], 2).unwrap();
        assert_eq!(stacked.rows(), 3);
        let parts = stacked.split(&[1, 2]).unwrap();
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn test_split_rejects_bad_lengths() {
        let m = ScoreMatrix::zeros(3, 2);
        assert!(matches!(
            m.split(&[1, 1]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let model = LinearModel::new(4, 3, Activation::Softmax);
        let inputs = ScoreMatrix::from_rows(vec![vec![0.1, 0.2, 0.3, 0.4]], 4).unwrap();
        let scores = model.predict(&inputs).unwrap();
        let sum: f32 = scores.row(0).iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_logistic_bounded() {
        let model = LinearModel::new(2, 2, Activation::Logistic);
        let inputs = ScoreMatrix::from_rows(vec![vec![10.0, -10.0]], 2).unwrap();
        let scores = model.predict(&inputs).unwrap();
        for &v in scores.row(0) {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_model_slot_fails_fast() {
        let slot = ModelSlot::default();
        assert!(matches!(
            slot.get("tagger"),
            Err(Error::ModelNotReady(_))
        ));
    }

    #[test]
    fn test_training_moves_scores_toward_gold() {
        let mut model = LinearModel::new(2, 2, Activation::Softmax);
        let inputs =
            ScoreMatrix::from_rows(vec![vec![1.0, 0.0], vec![0.0, 1.0]], 2).unwrap();
        let mut sgd = SgdOptimizer { learn_rate: 0.5 };
        for _ in 0..50 {
            let scores = model.begin_update(&inputs).unwrap();
            // Gold: row 0 -> label 0, row 1 -> label 1.
            let mut d = ScoreMatrix::zeros(2, 2);
            for i in 0..2 {
                for j in 0..2 {
                    let truth = if i == j { 1.0 } else { 0.0 };
                    d.row_mut(i)[j] = scores.row(i)[j] - truth;
                }
            }
            model.backprop(&d).unwrap();
            model.finish_update(&mut sgd).unwrap();
        }
        let scores = model.predict(&inputs).unwrap();
        assert_eq!(argmax(scores.row(0)), 0);
        assert_eq!(argmax(scores.row(1)), 1);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut model = LinearModel::new(3, 2, Activation::Softmax);
        let inputs = ScoreMatrix::from_rows(vec![vec![1.0, 2.0, 3.0]], 3).unwrap();
        let scores = model.begin_update(&inputs).unwrap();
        let mut d = ScoreMatrix::zeros(1, 2);
        d.row_mut(0)[0] = scores.row(0)[0] - 1.0;
        d.row_mut(0)[1] = scores.row(0)[1];
        model.backprop(&d).unwrap();
        model
            .finish_update(&mut SgdOptimizer { learn_rate: 0.1 })
            .unwrap();

        let bytes = model.to_bytes().unwrap();
        let mut restored = LinearModel::new(3, 2, Activation::Softmax);
        restored.load_bytes(&bytes).unwrap();
        assert_eq!(
            model.predict(&inputs).unwrap(),
            restored.predict(&inputs).unwrap()
        );
    }

    #[test]
    fn test_load_bytes_shape_checked() {
        let other = LinearModel::new(4, 5, Activation::Softmax).to_bytes().unwrap();
        let mut model = LinearModel::new(3, 2, Activation::Softmax);
        assert!(matches!(
            model.load_bytes(&other),
            Err(Error::IncompatibleModelFormat(_))
        ));
    }

    #[test]
    fn test_failed_backprop_leaves_params_unmodified() {
        let mut model = LinearModel::new(2, 2, Activation::Softmax);
        let before = model.to_bytes().unwrap();
        let d = ScoreMatrix::zeros(1, 2);
        // No begin_update: backprop must fail and change nothing.
        assert!(model.backprop(&d).is_err());
        assert_eq!(model.to_bytes().unwrap(), before);
    }
}
