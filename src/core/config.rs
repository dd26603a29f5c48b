//! Purpose: Section/key string lookups backing the subsystem registry.
//! Exports: `ConfigSource`, `MemoryConfig`, `JsonFileConfig`.
//! Role: The only way the core reads configuration; callers decide whether a missing
//! key is an error.
//! Invariants: Lookups are exact and case-sensitive; values are returned verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::error::{Error, ErrorKind};

pub trait ConfigSource: Send + Sync {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    /// Keys of `section` in sorted order; empty when the section is absent.
    fn keys(&self, section: &str) -> Vec<String>;
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Clone, Debug, Default)]
pub struct MemoryConfig {
    sections: Sections,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, section: &str, key: &str, value: impl Into<String>) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }
}

impl ConfigSource for MemoryConfig {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        lookup(&self.sections, section, key)
    }

    fn keys(&self, section: &str) -> Vec<String> {
        section_keys(&self.sections, section)
    }
}

#[derive(Deserialize)]
#[serde(transparent)]
struct ConfigDocument {
    sections: Sections,
}

/// `{ "<section>": { "<key>": "<value>" } }` read once at construction.
#[derive(Clone, Debug)]
pub struct JsonFileConfig {
    path: PathBuf,
    sections: Sections,
}

impl JsonFileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read config file")
                .with_path(path)
                .with_source(err)
        })?;
        let document: ConfigDocument = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::ConfigInvalid)
                .with_message(format!("config is not a section map: {err}"))
                .with_path(path)
                .with_source(err)
        })?;
        tracing::debug!(
            path = %path.display(),
            sections = document.sections.len(),
            "config loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            sections: document.sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for JsonFileConfig {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        lookup(&self.sections, section, key)
    }

    fn keys(&self, section: &str) -> Vec<String> {
        section_keys(&self.sections, section)
    }
}

fn lookup(sections: &Sections, section: &str, key: &str) -> Option<String> {
    sections.get(section)?.get(key).cloned()
}

fn section_keys(sections: &Sections, section: &str) -> Vec<String> {
    sections
        .get(section)
        .map(|values| values.keys().cloned().collect())
        .unwrap_or_default()
}
