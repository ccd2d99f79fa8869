//! Plugin metadata read from a plugin's namespace after it has executed

use serde::{Deserialize, Serialize};
use std::fmt;

/// A plugin's declared name and author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub author: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
        }
    }

    /// Human readable `"<name> by <author>"`
    pub fn info(&self) -> String {
        format!("{} by {}", self.name, self.author)
    }
}

impl fmt::Display for PluginMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}
