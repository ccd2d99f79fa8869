//! Test harness helpers
//!
//! Collects what the logger emitted while a closure ran, split the way a
//! console would see it: warnings, errors and plugin output on stdout,
//! errors alone on stderr.

use std::path::Path;

use crate::core::logger::{self, CapturedRecord, LogLevel};
use crate::sandbox::api;
use crate::sandbox::{PluginHost, PluginLoader, PluginMetadata};

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    records: Vec<CapturedRecord>,
}

impl CapturedOutput {
    pub fn records(&self) -> &[CapturedRecord] {
        &self.records
    }

    /// Number of records logged at exactly `level`
    pub fn count(&self, level: LogLevel) -> usize {
        self.records.iter().filter(|record| record.level == level).count()
    }

    pub fn stdout(&self) -> String {
        self.join(|record| record.level <= LogLevel::Warning || record.target == api::TARGET)
    }

    pub fn stderr(&self) -> String {
        self.join(|record| record.level <= LogLevel::Error)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records.iter().any(|record| record.message.contains(needle))
    }

    fn join(&self, keep: impl Fn(&CapturedRecord) -> bool) -> String {
        self.records
            .iter()
            .filter(|record| keep(record))
            .map(|record| format!("{}\n", record.message))
            .collect()
    }
}

/// Run `f`, returning its value and everything it logged on this thread
pub fn capture_output<T>(f: impl FnOnce() -> T) -> (T, CapturedOutput) {
    let (value, records) = logger::capture(f);
    (value, CapturedOutput { records })
}

/// Load one plugin file and report its metadata with the captured output
pub fn try_plugin(host: &PluginHost, path: &Path) -> (Option<PluginMetadata>, CapturedOutput) {
    let (result, output) = capture_output(|| PluginLoader::new(host).load_plugin(path));
    (result.ok().map(|plugin| plugin.metadata), output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use tempfile::TempDir;

    #[test]
    fn test_try_plugin_splits_streams() {
        let temp_dir = TempDir::new().unwrap();
        let host = PluginHost::new(&SandboxConfig::default()).unwrap();

        let chatty = temp_dir.path().join("chatty.lua");
        std::fs::write(&chatty, "print('hello from plugin') NAME = 'Chatty'").unwrap();
        let (metadata, output) = try_plugin(&host, &chatty);
        assert_eq!(metadata.unwrap().name, "Chatty");
        assert!(output.stdout().contains("hello from plugin"));
        assert!(output.stderr().is_empty());

        let broken = temp_dir.path().join("broken.lua");
        std::fs::write(&broken, "error('kaboom')").unwrap();
        let (metadata, output) = try_plugin(&host, &broken);
        assert!(metadata.is_none());
        assert!(output.stderr().contains("Error loading plugin 'broken.lua'"));
        assert!(output.stderr().contains("kaboom"));
        assert!(output.stdout().contains("kaboom"));
    }
}
