//! # Plugin Sandbox
//!
//! Loads untrusted Lua plugins and restricts what they can reach while their
//! code runs:
//! - `require` is limited to an allow list of modules
//! - file handles (`io.open`, `dofile`, `loadfile`) are refused outright
//! - `load` is reserved for trusted host code
//!
//! Every successfully loaded plugin comes back with its [`PluginMetadata`];
//! failures are logged and skipped.
//!
//! ## Quick Start
//!
//! ```no_run
//! use plugin_sandbox::config::SandboxConfig;
//! use plugin_sandbox::{PluginHost, PluginLoader};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let host = PluginHost::new(&SandboxConfig::default())?;
//!     let plugins = PluginLoader::new(&host).load_all(Path::new("plugins"), "plugin.lua")?;
//!     for plugin in &plugins {
//!         println!("{}", plugin.metadata);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod sandbox;
pub mod testing;

// Re-export commonly used types for convenience
pub use sandbox::{
    AllowList, CapabilityDenied, CapabilityKind, ExecutionUnit, LoadError, LoadedPlugin,
    PluginHost, PluginLoader, PluginMetadata,
};
