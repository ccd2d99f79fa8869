//! Sandboxed plugin loading
//!
//! Plugins are Lua files run inside a shared interpreter owned by a
//! [`PluginHost`]. Each plugin gets its own namespace ([`ExecutionUnit`]);
//! while its code runs, the host's [`CapabilityTable`] is intercepted:
//!
//! - `require` only resolves allow-listed modules
//! - `io.open`, `dofile` and `loadfile` are refused
//! - `load` only works for trusted host code
//!
//! After the run the original capabilities are restored and `NAME` /
//! `AUTHOR` are read into a [`PluginMetadata`]. Plugin functions that run
//! later (finalizers, functions pulled out of a namespace) are refused every
//! capability; use [`PluginHost::invoke`] to call into a plugin.
//!
//! # Plugin Structure
//!
//! ```lua
//! NAME = "Weather"
//! AUTHOR = "Akaere Networks"
//!
//! local math = require("math")
//! ```
//!
//! Both attributes are optional.

pub mod api;
mod budget;
pub mod capability;
pub mod discovery;
pub mod error;
pub mod host;
pub mod interceptor;
pub mod loader;
pub mod metadata;
pub mod policy;
pub mod unit;

pub use capability::{CallerOrigin, CapabilitySnapshot, CapabilityTable};
pub use discovery::discover_plugins;
pub use error::{CapabilityDenied, CapabilityKind, LoadError};
pub use host::PluginHost;
pub use interceptor::{InterceptScope, Interceptor, SavedState};
pub use loader::{LoadedPlugin, PluginLoader};
pub use metadata::PluginMetadata;
pub use policy::{AllowList, Policy};
pub use unit::{ExecutionUnit, UnitState};
