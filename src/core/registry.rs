// Subsystem identifier -> module path, read from the `subsystems` config section.
use std::path::PathBuf;

use crate::core::config::ConfigSource;
use crate::core::error::{Error, ErrorKind};

pub const SUBSYSTEMS_SECTION: &str = "subsystems";

pub struct SubsystemRegistry {
    config: Box<dyn ConfigSource>,
}

impl SubsystemRegistry {
    pub fn new(config: impl ConfigSource + 'static) -> Self {
        Self {
            config: Box::new(config),
        }
    }

    /// Absence is an answer here, not an error.
    pub fn is_registered(&self, identifier: &str) -> bool {
        self.config
            .get_string(SUBSYSTEMS_SECTION, identifier)
            .is_some()
    }

    pub fn module_path(&self, identifier: &str) -> Result<PathBuf, Error> {
        let value = self
            .config
            .get_string(SUBSYSTEMS_SECTION, identifier)
            .ok_or_else(|| {
                Error::new(ErrorKind::ConfigMissing)
                    .with_message(format!("no {SUBSYSTEMS_SECTION} entry"))
                    .with_identifier(identifier)
            })?;
        if value.trim().is_empty() {
            return Err(Error::new(ErrorKind::ConfigInvalid)
                .with_message("module path is empty")
                .with_identifier(identifier));
        }
        Ok(PathBuf::from(value))
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.config.keys(SUBSYSTEMS_SECTION)
    }
}
