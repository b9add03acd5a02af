//! Versioned component persistence.
//!
//! Each component persists a small set of independently named, independently
//! excludable sections: its configuration, its label/tag tables where
//! applicable, and its model parameters as an opaque byte blob. Section
//! order matters on load: configuration is restored first because the later
//! sections are shape-dependent on configuration values.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Conventional section name for component configuration.
pub const SECTION_CFG: &str = "cfg";
/// Conventional section name for the label set.
pub const SECTION_LABELS: &str = "labels";
/// Conventional section name for the tag map (tagger family only).
pub const SECTION_TAG_MAP: &str = "tag_map";
/// Conventional section name for model parameter bytes.
pub const SECTION_MODEL: &str = "model";
/// Conventional section name for an attached knowledge-base blob.
pub const SECTION_KB: &str = "kb";

/// A named-section archive for one pipeline component.
///
/// Sections are ordered by name for stable output; load order is the
/// responsibility of each component's [`Persist`] implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentArchive {
    sections: BTreeMap<String, Vec<u8>>,
}

impl ComponentArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a JSON-serialized section.
    pub fn put_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        self.sections
            .insert(name.to_string(), serde_json::to_vec(value)?);
        Ok(())
    }

    /// Store a raw byte section (e.g. model parameters).
    pub fn put_bytes(&mut self, name: &str, bytes: Vec<u8>) {
        self.sections.insert(name.to_string(), bytes);
    }

    /// Read a JSON section, if present.
    pub fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.sections.get(name) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a raw byte section, if present.
    #[must_use]
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    /// Whether a section exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Section names in stable order.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Serialize the whole archive.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an archive.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Whether a section name is excluded from a save/load operation.
#[must_use]
pub fn excluded(name: &str, exclude: &[&str]) -> bool {
    exclude.contains(&name)
}

/// Section-based persistence for a pipeline component.
///
/// Implementations write and read the sections they own; every section must
/// be skippable via `exclude` for partial save/load. `from_archive` must
/// restore configuration before label tables and the model, and must lazily
/// rebuild the model from the now-known shapes before loading parameter
/// bytes into it.
pub trait Persist {
    /// Write all non-excluded sections.
    fn to_archive(&self, exclude: &[&str]) -> Result<ComponentArchive>;

    /// Restore all non-excluded sections, configuration first.
    fn from_archive(&mut self, archive: &ComponentArchive, exclude: &[&str]) -> Result<()>;

    /// Serialize to bytes.
    fn to_component_bytes(&self, exclude: &[&str]) -> Result<Vec<u8>> {
        self.to_archive(exclude)?.to_bytes()
    }

    /// Restore from bytes produced by [`Persist::to_component_bytes`].
    fn from_component_bytes(&mut self, bytes: &[u8], exclude: &[&str]) -> Result<()> {
        self.from_archive(&ComponentArchive::from_bytes(bytes)?, exclude)
    }
}
