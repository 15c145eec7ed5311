//! Path allow-list handed to the owning application's syscall filter.
//!
//! The store never installs a filter itself. It only reports which paths it
//! may touch and how, so the application can build one before dropping
//! privileges.

use std::path::{Path, PathBuf};

/// Kind of access a rule grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// open(2) for reading, plus stat(2)
    Read,
    /// open(2) for writing / creating
    Write,
    /// rename(2) from this path
    Rename,
    /// unlink(2)
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRule {
    pub path: PathBuf,
    pub access: Access,
}

/// Accumulates rules from every component that registers with it.
#[derive(Debug, Default, Clone)]
pub struct SandboxConfig {
    rules: Vec<SandboxRule>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, path: impl Into<PathBuf>, access: Access) {
        self.rules.push(SandboxRule {
            path: path.into(),
            access,
        });
    }

    pub fn rules(&self) -> &[SandboxRule] {
        &self.rules
    }

    pub fn is_allowed(&self, path: &Path, access: Access) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.access == access && rule.path == path)
    }
}
