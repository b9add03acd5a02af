//! Error types for seqpipe.

use thiserror::Error;

/// Result type for seqpipe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for seqpipe operations.
///
/// Every variant is fatal to the call that raised it. No operation in this
/// crate retries, and a failed update leaves model parameters unmodified.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Predict/update was called before the component's model was built.
    #[error("model not ready: {0}")]
    ModelNotReady(String),

    /// A label string was empty or otherwise unusable.
    #[error("invalid label: {0}")]
    InvalidLabel(String),

    /// An architecture-changing edit (label growth, tag map rebuild) was
    /// attempted after the model was instantiated. Output layers are not
    /// resizable once built; resizing in place would silently corrupt
    /// downstream ensemble layers.
    #[error("model already shaped: {0}")]
    ModelAlreadyShaped(String),

    /// A parameter blob could not be loaded into the component's model.
    #[error("incompatible model format: {0}")]
    IncompatibleModelFormat(String),

    /// Entity disambiguation was attempted without a knowledge base attached.
    #[error("no knowledge base attached: {0}")]
    MissingKnowledgeBase(String),

    /// A gold-annotated mention span does not correspond to any recognized
    /// entity span in the document. Signals corrupt training data.
    #[error("gold alignment failed: {0}")]
    GoldAlignment(String),

    /// Parallel score/gold arrays diverged in length. Never swallowed: a
    /// silent mismatch would corrupt gradients.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Extent the caller expected.
        expected: usize,
        /// Extent actually observed.
        got: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Create a model-not-ready error.
    pub fn model_not_ready(msg: impl Into<String>) -> Self {
        Error::ModelNotReady(msg.into())
    }

    /// Create an invalid-label error.
    pub fn invalid_label(msg: impl Into<String>) -> Self {
        Error::InvalidLabel(msg.into())
    }

    /// Create a model-already-shaped error.
    pub fn model_already_shaped(msg: impl Into<String>) -> Self {
        Error::ModelAlreadyShaped(msg.into())
    }

    /// Create an incompatible-model-format error.
    pub fn incompatible_model_format(msg: impl Into<String>) -> Self {
        Error::IncompatibleModelFormat(msg.into())
    }

    /// Create a missing-knowledge-base error.
    pub fn missing_knowledge_base(msg: impl Into<String>) -> Self {
        Error::MissingKnowledgeBase(msg.into())
    }

    /// Create a gold-alignment error.
    pub fn gold_alignment(msg: impl Into<String>) -> Self {
        Error::GoldAlignment(msg.into())
    }

    /// Create a shape-mismatch error.
    pub fn shape_mismatch(expected: usize, got: usize) -> Self {
        Error::ShapeMismatch { expected, got }
    }
}
