//! Plugin discovery

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively collect every file called `file_name` under `root`
///
/// The result is sorted by file name, ties broken by full path. Finding
/// nothing is not an error, only a warning.
pub fn discover_plugins(root: &Path, file_name: &str) -> Vec<PathBuf> {
    let mut plugin_paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                crate::log_debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
        .collect();

    if plugin_paths.is_empty() {
        crate::log_warn!("No plugin scripts found in {} folder.", root.display());
        return plugin_paths;
    }

    plugin_paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    plugin_paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::LogLevel;
    use crate::testing::capture_output;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory_warns_once() {
        let temp_dir = TempDir::new().unwrap();

        let (paths, output) = capture_output(|| discover_plugins(temp_dir.path(), "plugin.lua"));
        assert!(paths.is_empty());
        assert_eq!(output.count(LogLevel::Warning), 1);
        assert!(output.stdout().contains("No plugin scripts found"));
    }

    #[test]
    fn test_nested_plugins_found_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for dir in ["zeta", "alpha/deep", "mid"] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join("plugin.lua"), "").unwrap();
        }
        fs::write(root.join("mid").join("notes.txt"), "").unwrap();
        fs::write(root.join("mid").join("plugin.lua.bak"), "").unwrap();

        let (paths, output) = capture_output(|| discover_plugins(root, "plugin.lua"));
        assert_eq!(output.count(LogLevel::Warning), 0);
        assert_eq!(
            paths,
            vec![
                root.join("alpha/deep/plugin.lua"),
                root.join("mid/plugin.lua"),
                root.join("zeta/plugin.lua"),
            ]
        );
    }

    #[test]
    fn test_custom_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b").join("alpha.lua"), "").unwrap();
        fs::write(root.join("a").join("beta.lua"), "").unwrap();

        let (alpha, _) = capture_output(|| discover_plugins(root, "alpha.lua"));
        assert_eq!(alpha, vec![root.join("b/alpha.lua")]);

        let (beta, _) = capture_output(|| discover_plugins(root, "beta.lua"));
        assert_eq!(beta, vec![root.join("a/beta.lua")]);

        let (default_name, output) = capture_output(|| discover_plugins(root, "plugin.lua"));
        assert!(default_name.is_empty());
        assert_eq!(output.count(LogLevel::Warning), 1);
    }
}
