//! Label tables: insertion-ordered label sets and the morphological tag map.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An insertion-ordered mapping from label string to dense integer id.
///
/// Ids are assigned in insertion order and never change once assigned; the
/// ordered name list is what gets persisted, so ids survive a
/// serialize/deserialize round trip verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelSet {
    /// Create an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, returning its stable id. Existing labels keep their id.
    ///
    /// # Errors
    /// Returns [`Error::InvalidLabel`] for empty or all-whitespace labels.
    pub fn add(&mut self, label: &str) -> Result<usize> {
        if label.trim().is_empty() {
            return Err(Error::invalid_label("label must be a non-empty string"));
        }
        if let Some(&id) = self.index.get(label) {
            return Ok(id);
        }
        let id = self.names.len();
        self.names.push(label.to_string());
        self.index.insert(label.to_string(), id);
        Ok(id)
    }

    /// Id of a label, if present.
    #[must_use]
    pub fn id_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    /// Label at a given id, if in range.
    #[must_use]
    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Whether the label is present.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Labels in id order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for LabelSet {
    fn from(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self { names, index }
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(set: LabelSet) -> Self {
        set.names
    }
}

/// Attributes attached to a fine-grained tag in the tag map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAttrs {
    /// Coarse part-of-speech for the tag.
    pub pos: String,
}

/// Mapping from fine-grained tag to morphological attributes.
///
/// Growth is snapshot-based: [`TagMap::with_entry`] returns a new map rather
/// than mutating in place, so the model-rebuild step consumes a consistent
/// immutable snapshot and partial updates are never observable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagMap {
    entries: BTreeMap<String, TagAttrs>,
}

impl TagMap {
    /// Create an empty tag map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new map with `tag` mapped to `attrs` (snapshot growth).
    #[must_use]
    pub fn with_entry(&self, tag: &str, attrs: TagAttrs) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(tag.to_string(), attrs);
        Self { entries }
    }

    /// Coarse POS for a tag, if mapped.
    #[must_use]
    pub fn pos_of(&self, tag: &str) -> Option<&str> {
        self.entries.get(tag).map(|a| a.pos.as_str())
    }

    /// Whether the tag is mapped.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Number of mapped tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
