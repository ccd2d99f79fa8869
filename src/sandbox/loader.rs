//! Plugin loading logic
//!
//! Turns plugin files into [`LoadedPlugin`]s. One bad plugin never aborts a
//! batch: every failure is logged with the plugin's file name and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::sandbox::discovery::discover_plugins;
use crate::sandbox::error::LoadError;
use crate::sandbox::host::PluginHost;
use crate::sandbox::metadata::PluginMetadata;
use crate::sandbox::unit::ExecutionUnit;

/// A plugin whose top-level code ran to completion
#[derive(Debug)]
pub struct LoadedPlugin {
    pub unit: ExecutionUnit,
    pub metadata: PluginMetadata,
}

impl LoadedPlugin {
    pub fn into_parts(self) -> (ExecutionUnit, PluginMetadata) {
        (self.unit, self.metadata)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

pub struct PluginLoader<'h> {
    host: &'h PluginHost,
    verbose: bool,
}

impl<'h> PluginLoader<'h> {
    pub fn new(host: &'h PluginHost) -> Self {
        Self {
            host,
            verbose: true,
        }
    }

    /// Log each successful load at info level
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Load one plugin file
    ///
    /// Failures are logged here before being returned, so callers that only
    /// care about successes can drop the error.
    pub fn load_plugin(&self, path: &Path) -> Result<LoadedPlugin, LoadError> {
        let result = self.try_load(path);
        if let Err(e) = &result {
            crate::log_error!("Error loading plugin '{}': {}", display_name(path), e);
        }
        result
    }

    fn try_load(&self, path: &Path) -> Result<LoadedPlugin, LoadError> {
        let mut unit = self.host.create_unit(path)?;
        let source = fs::read_to_string(path)?;

        self.host.execute(&mut unit, &source)?;

        let metadata = match unit.metadata(self.host.lua()) {
            Ok(metadata) => metadata,
            Err(e) => {
                unit.mark_failed();
                return Err(e);
            }
        };

        if self.verbose {
            let mut message = format!("Successfully loaded {}", metadata.name);
            if !metadata.author.is_empty() {
                message.push_str(&format!(" by {}", metadata.author));
            }
            crate::log_info!("{}", message);
        }

        Ok(LoadedPlugin { unit, metadata })
    }

    /// Load every path in order, keeping only the successes
    pub fn load_plugins<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<LoadedPlugin> {
        paths
            .iter()
            .filter_map(|path| self.load_plugin(path.as_ref()).ok())
            .collect()
    }

    /// Discover and load every plugin under `root`, creating `root` if needed
    pub fn load_all(&self, root: &Path, file_name: &str) -> std::io::Result<Vec<LoadedPlugin>> {
        if !root.exists() {
            crate::log_info!("Creating plugins directory {}", root.display());
            fs::create_dir_all(root)?;
        }

        let paths: Vec<PathBuf> = discover_plugins(root, file_name);
        let plugins = self.load_plugins(&paths);

        crate::log_info!(
            "Loaded {} plugin(s), skipped {}",
            plugins.len(),
            paths.len() - plugins.len()
        );

        Ok(plugins)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::core::logger::LogLevel;
    use crate::sandbox::error::CapabilityKind;
    use crate::sandbox::policy::AllowList;
    use crate::sandbox::unit::UnitState;
    use crate::testing::capture_output;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn host() -> PluginHost {
        let config = SandboxConfig {
            allow_list: AllowList::new(["math"]),
            ..SandboxConfig::default()
        };
        PluginHost::new(&config).unwrap()
    }

    fn write_plugin(dir: &Path, name: &str, source: &str) -> PathBuf {
        let plugin_dir = dir.join(name);
        fs::create_dir_all(&plugin_dir).unwrap();
        let path = plugin_dir.join("plugin.lua");
        let mut file = File::create(&path).unwrap();
        write!(file, "{}", source).unwrap();
        path
    }

    #[test]
    fn test_plugin_without_metadata_uses_file_stem() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(temp_dir.path(), "bare", "local answer = 42");
        let host = host();

        let plugin = PluginLoader::new(&host).load_plugin(&path).unwrap();
        assert_eq!(plugin.metadata, PluginMetadata::new("plugin", ""));
        assert_eq!(plugin.unit.state(), UnitState::Loaded);
    }

    #[test]
    fn test_declared_metadata_is_trimmed() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(
            temp_dir.path(),
            "named",
            "NAME = \"  Foo  \"\nAUTHOR = \"Bar \"\n",
        );
        let host = host();

        let (unit, metadata) = PluginLoader::new(&host)
            .load_plugin(&path)
            .unwrap()
            .into_parts();
        assert_eq!(metadata, PluginMetadata::new("Foo", "Bar"));
        assert_eq!(unit.id(), "plugin");
    }

    #[test]
    fn test_allow_listed_import_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(
            temp_dir.path(),
            "math",
            "local m = require('math')\nNAME = 'Floor ' .. m.floor(2.7)\n",
        );
        let host = host();

        let plugin = PluginLoader::new(&host).load_plugin(&path).unwrap();
        assert_eq!(plugin.name(), "Floor 2");
    }

    #[test]
    fn test_silenced_import_yields_nil() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(
            temp_dir.path(),
            "silenced",
            "local io_mod = require('io')\nNAME = 'io is ' .. tostring(io_mod)\n",
        );
        let host = host();

        let (result, output) = capture_output(|| PluginLoader::new(&host).load_plugin(&path));
        assert_eq!(result.unwrap().name(), "io is nil");
        assert_eq!(output.count(LogLevel::Error), 0);
    }

    #[test]
    fn test_module_mutations_stay_in_one_plugin() {
        let temp_dir = TempDir::new().unwrap();
        let tamper = write_plugin(
            temp_dir.path(),
            "tamper",
            "local m = require('math')\n\
             m.floor = function() return -1 end\n\
             assert(require('math') == m)\n\
             NAME = tostring(m.floor(2.5))\n",
        );
        let reader = write_plugin(
            temp_dir.path(),
            "reader",
            "NAME = tostring(require('math').floor(2.5))\n",
        );
        let host = host();

        let plugins = PluginLoader::new(&host).load_plugins(&[tamper, reader]);
        let names: Vec<&str> = plugins.iter().map(LoadedPlugin::name).collect();
        assert_eq!(names, vec!["-1", "2"]);

        let floor: i64 = host.lua().load("return math.floor(2.5)").eval().unwrap();
        assert_eq!(floor, 2);
    }

    #[test]
    fn test_denied_import_is_logged_not_propagated() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(temp_dir.path(), "bad_import", "local os = require('os')");
        let host = host();
        let loader = PluginLoader::new(&host);

        let (result, output) = capture_output(|| loader.load_plugin(&path));
        assert_eq!(result.unwrap_err().denied().unwrap().kind, CapabilityKind::Import);
        assert_eq!(output.count(LogLevel::Error), 1);
        assert!(output.stderr().contains("Error loading plugin 'plugin.lua'"));

        let (plugins, _) = capture_output(|| loader.load_plugins(&[path]));
        assert!(plugins.is_empty());
    }

    #[test]
    fn test_file_open_always_denied() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("data.txt");
        fs::write(&existing, "secret").unwrap();
        let host = host();
        let loader = PluginLoader::new(&host);

        let attempts = [
            format!("io.open([[{}]])", existing.display()),
            format!("io.open([[{}]], 'w')", temp_dir.path().join("new.txt").display()),
            "io.open('/definitely/not/here', 'rb')".to_string(),
            format!("dofile([[{}]])", existing.display()),
            format!("local chunk = loadfile([[{}]])", existing.display()),
        ];

        for (i, attempt) in attempts.iter().enumerate() {
            let path = write_plugin(temp_dir.path(), &format!("open{}", i), attempt);
            let (result, _) = capture_output(|| loader.load_plugin(&path));
            let err = result.err().unwrap();
            assert_eq!(err.denied().unwrap().kind, CapabilityKind::FileOpen, "{}", attempt);
        }
        assert!(!temp_dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_dynamic_eval_denied_for_plugins() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(temp_dir.path(), "eval", "local f = load('return 1')");
        let host = host();

        let (result, _) = capture_output(|| PluginLoader::new(&host).load_plugin(&path));
        assert_eq!(
            result.err().unwrap().denied().unwrap().kind,
            CapabilityKind::DynamicEval
        );
    }

    #[test]
    fn test_capabilities_restored_after_denial() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(temp_dir.path(), "denied", "io.open('anything')");
        let host = host();
        let before = host.capabilities().snapshot();

        let (result, _) = capture_output(|| PluginLoader::new(&host).load_plugin(&path));
        assert!(result.is_err());
        assert_eq!(before, host.capabilities().snapshot());

        // Would fail had the file guard stayed installed
        let target = temp_dir.path().join("after.txt");
        host.lua()
            .load(format!(
                "local f = assert(io.open([[{}]], 'w')) f:write('ok') f:close()",
                target.display()
            ))
            .exec()
            .unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "ok");
    }

    #[test]
    fn test_batch_skips_failing_plugin() {
        let temp_dir = TempDir::new().unwrap();
        let paths = vec![
            write_plugin(temp_dir.path(), "a", "NAME = 'A'"),
            write_plugin(temp_dir.path(), "b", "local x = 1 // 0"),
            write_plugin(temp_dir.path(), "c", "NAME = 'C'"),
        ];
        let host = host();

        let (plugins, output) = capture_output(|| PluginLoader::new(&host).load_plugins(&paths));
        let names: Vec<&str> = plugins.iter().map(LoadedPlugin::name).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(output.count(LogLevel::Error), 1);
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let host = host();
        let (result, _) = capture_output(|| {
            PluginLoader::new(&host).load_plugin(&temp_dir.path().join("gone.lua"))
        });
        assert!(matches!(result, Err(LoadError::Io(_))));
    }

    #[test]
    fn test_load_all_creates_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let host = host();

        let (plugins, output) =
            capture_output(|| PluginLoader::new(&host).load_all(&root, "plugin.lua"));
        assert!(plugins.unwrap().is_empty());
        assert!(root.is_dir());
        assert_eq!(output.count(LogLevel::Warning), 1);
    }

    #[test]
    fn test_verbose_logs_success() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_plugin(temp_dir.path(), "v", "NAME = 'Loud' AUTHOR = 'Me'");
        let host = host();

        let (_, output) = capture_output(|| PluginLoader::new(&host).load_plugin(&path));
        assert!(output.contains("Successfully loaded Loud by Me"));

        let (_, quiet) =
            capture_output(|| PluginLoader::new(&host).verbose(false).load_plugin(&path));
        assert!(!quiet.contains("Successfully loaded"));
    }
}
