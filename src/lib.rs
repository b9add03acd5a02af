//! # seqpipe
//!
//! Trainable text-annotation pipeline components: a part-of-speech tagger, a
//! statistical sentence-boundary recognizer, a rule-based sentencizer, a
//! multi-label text categorizer, an entity disambiguator backed by a
//! knowledge base, and auxiliary multi-task objectives for shared-encoder
//! training.
//!
//! Components compose through small capability traits rather than a base
//! class: [`Scorable`] for pure batch prediction, [`Annotatable`] for
//! add-only writes into documents, [`Trainable`] for incremental updates,
//! and the object-safe [`Pipe`] for chaining heterogeneous components in a
//! [`Pipeline`]. Scoring models plug in behind the [`ScoredModel`] trait;
//! a small linear scorer is built in.
//!
//! ## Quick start
//!
//! ```
//! use seqpipe::{Document, Example, Tagger, Trainable, Scorable, Annotatable};
//! use std::collections::HashMap;
//!
//! let mut tagger = Tagger::new("tagger");
//! let examples = vec![
//!     Example::new(Document::from_words(&["dogs", "bark"]))
//!         .with_tags(vec![Some("NOUN".into()), Some("VERB".into())]),
//! ];
//! let mut sgd = tagger.begin_training(&examples, None)?;
//! let mut losses = HashMap::new();
//! for _ in 0..10 {
//!     tagger.update(&examples, 0.0, Some(sgd.as_mut()), &mut losses)?;
//! }
//!
//! let mut docs = [Document::from_words(&["dogs", "bark"])];
//! let scores = tagger.predict(&docs)?;
//! tagger.set_annotations(&mut docs, &scores);
//! assert!(docs[0].tokens[0].tag.is_some());
//! # Ok::<(), seqpipe::Error>(())
//! ```

pub mod component;
pub mod doc;
pub mod error;
pub mod labels;
pub mod linker;
pub mod model;
pub mod multitask;
pub mod senter;
pub mod sentencizer;
pub mod serialize;
pub mod similarity;
pub mod tagger;
pub mod textcat;

pub use component::{minibatch, Annotatable, Pipe, Pipeline, Scorable, Trainable};
pub use doc::{Boundary, Document, EntitySpan, Example, GoldParse, Token};
pub use error::{Error, Result};
pub use labels::{LabelSet, TagAttrs, TagMap};
pub use linker::{Candidate, EntityLinker, EntityLinkerConfig, InMemoryKb, KnowledgeBase, NIL_LINK};
pub use model::{
    Activation, FailingModel, LinearModel, ModelSlot, Optimizer, ScoreMatrix, ScoredModel,
    SgdOptimizer,
};
pub use multitask::{AuxTarget, MultitaskConfig, MultitaskObjective};
pub use senter::{SentenceRecognizer, SentenceRecognizerConfig};
pub use sentencizer::{Sentencizer, SentencizerConfig};
pub use serialize::{ComponentArchive, Persist};
pub use tagger::{Tagger, TaggerConfig};
pub use textcat::{TextCategorizer, TextCategorizerConfig};
