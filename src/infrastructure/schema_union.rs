//! Discovered schema: every attribute key ever observed
//!
//! Keys keep first-seen order so downstream column layouts stay stable
//! between runs. The per-section breakdown is kept sorted.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::domain::AttributeEntry;
use crate::infrastructure::state_store::{StoreResult, read_json, write_json_atomic};

pub const SCHEMA_FILE: &str = "discovered_schema.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchemaDocument {
    keys: Vec<String>,
    #[serde(default)]
    sections: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug)]
pub struct SchemaUnion {
    path: PathBuf,
    keys: IndexSet<String>,
    sections: BTreeMap<String, BTreeSet<String>>,
    dirty: bool,
}

impl SchemaUnion {
    /// Loads `processed/discovered_schema.json`, starting empty when absent
    pub async fn load(processed_dir: &Path) -> StoreResult<Self> {
        let path = processed_dir.join(SCHEMA_FILE);
        let document: SchemaDocument = read_json(&path).await?.unwrap_or_default();
        debug!("Schema union loaded with {} keys", document.keys.len());
        Ok(Self {
            path,
            keys: document.keys.into_iter().collect(),
            sections: document.sections,
            dirty: false,
        })
    }

    /// Adds the keys of `attributes`; returns how many were new
    pub fn observe(&mut self, attributes: &[AttributeEntry]) -> usize {
        let mut added = 0;
        for attribute in attributes {
            if self.keys.insert(attribute.key.clone()) {
                added += 1;
            }
            self.dirty |= self
                .sections
                .entry(attribute.section.clone())
                .or_default()
                .insert(attribute.key.clone());
        }
        if added > 0 {
            self.dirty = true;
            debug!("🧩 Schema union grew by {} keys ({} total)", added, self.keys.len());
        }
        added
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.keys.iter().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Writes the document if anything changed since the last save
    pub async fn persist(&mut self) -> StoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let document = SchemaDocument {
            keys: self.keys.iter().cloned().collect(),
            sections: self.sections.clone(),
        };
        write_json_atomic(&self.path, &document).await?;
        self.dirty = false;
        info!("💾 Discovered schema saved: {} keys", self.keys.len());
        Ok(())
    }
}
