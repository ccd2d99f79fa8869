use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::policy::{AllowList, Policy};

// Discovery defaults
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";
pub const PLUGIN_FILE_NAME: &str = "plugin.lua";
pub const DEFAULT_CONFIG_PATH: &str = "sandbox.toml";

// Sandbox defaults
pub const DEFAULT_MEMORY_LIMIT: usize = 10_000_000; // 10 MB
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const BUDGET_CHECK_INTERVAL: u32 = 1_000; // VM instructions between clock checks

/// Plugin root override, read after `.env` has been loaded
pub fn plugins_dir_from_env() -> Option<PathBuf> {
    std::env::var("PLUGIN_SANDBOX_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
}

/// Contents of `sandbox.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Modules plugins may `require`
    #[serde(default = "default_allow_list")]
    pub allow_list: AllowList,
    /// Modules whose `require` quietly yields nil
    #[serde(default = "default_silenced_modules")]
    pub silenced_modules: Vec<String>,
    /// Wall-clock budget per plugin run in milliseconds, 0 disables it
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Interpreter memory limit in bytes, 0 disables it
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
}

fn default_allow_list() -> AllowList {
    AllowList::new(["math"])
}

fn default_silenced_modules() -> Vec<String> {
    vec!["io".to_string()]
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allow_list: default_allow_list(),
            silenced_modules: default_silenced_modules(),
            timeout_ms: default_timeout_ms(),
            memory_limit: default_memory_limit(),
        }
    }
}

impl SandboxConfig {
    pub fn policy(&self) -> Policy {
        Policy::new(self.allow_list.clone(), self.silenced_modules.clone())
    }

    pub fn budget(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PLUGINS_DIR)
}

fn default_file_name() -> String {
    PLUGIN_FILE_NAME.to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            file_name: default_file_name(),
        }
    }
}

impl Config {
    /// Read and parse a TOML config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;

        if config.discovery.file_name.trim().is_empty() {
            return Err(anyhow::anyhow!("discovery.file_name cannot be empty"));
        }

        Ok(config)
    }

    /// Load `path` if given, else `sandbox.toml` if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Load untrusted Lua plugins inside a capability sandbox")]
pub struct Cli {
    /// Directory searched recursively for plugins
    #[arg(short, long)]
    pub plugins_dir: Option<PathBuf>,

    /// Config file (default: ./sandbox.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Module plugins may require; repeat to allow several, replaces the configured list
    #[arg(short, long = "allow")]
    pub allow: Vec<String>,

    /// Execution budget per plugin in milliseconds (0 disables it)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Don't log each successfully loaded plugin
    #[arg(short, long)]
    pub quiet: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Format log output for journald
    #[arg(long)]
    pub journald: bool,

    /// Print loaded plugin metadata as JSON
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Layer command line and environment overrides on top of `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = plugins_dir_from_env() {
            config.discovery.plugins_dir = dir;
        }
        if let Some(dir) = &self.plugins_dir {
            config.discovery.plugins_dir = dir.clone();
        }
        if !self.allow.is_empty() {
            config.sandbox.allow_list = AllowList::new(self.allow.iter().cloned());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.sandbox.timeout_ms = timeout_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sandbox.allow_list, AllowList::new(["math"]));
        assert_eq!(config.sandbox.silenced_modules, vec!["io".to_string()]);
        assert_eq!(config.sandbox.budget(), Some(Duration::from_millis(5_000)));
        assert_eq!(config.discovery.plugins_dir, PathBuf::from("plugins"));
        assert_eq!(config.discovery.file_name, "plugin.lua");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml_str(
            r#"[sandbox]
allow_list = []
timeout_ms = 0

[discovery]
plugins_dir = "test"
"#,
        )
        .unwrap();

        assert!(config.sandbox.allow_list.is_empty());
        assert_eq!(config.sandbox.budget(), None);
        assert_eq!(config.sandbox.memory_limit, DEFAULT_MEMORY_LIMIT);
        assert_eq!(config.discovery.plugins_dir, PathBuf::from("test"));
        assert_eq!(config.discovery.file_name, "plugin.lua");
    }

    #[test]
    fn test_empty_file_name_rejected() {
        let result = Config::from_toml_str("[discovery]\nfile_name = \"  \"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sandbox.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[sandbox]\nallow_list = [\"math\", \"utf8\"]").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.sandbox.allow_list.contains("utf8"));
        assert!(Config::load(&temp_dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "plugin-sandbox",
            "--plugins-dir",
            "elsewhere",
            "--allow",
            "string",
            "--allow",
            "utf8",
            "--timeout-ms",
            "250",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.discovery.plugins_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.sandbox.allow_list, AllowList::new(["string", "utf8"]));
        assert_eq!(config.sandbox.timeout_ms, 250);
    }
}
