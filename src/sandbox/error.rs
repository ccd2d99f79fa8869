//! Error types for the plugin sandbox

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The capability a plugin tried to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// Resolving an external module (`require`)
    Import,
    /// Creating a file handle (`io.open`, `dofile`, `loadfile`)
    FileOpen,
    /// Evaluating source at runtime (`load`)
    DynamicEval,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::Import => "import",
            CapabilityKind::FileOpen => "file open",
            CapabilityKind::DynamicEval => "dynamic evaluation",
        };
        f.write_str(name)
    }
}

/// Raised at the point a plugin attempts a disallowed operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} is not allowed: {detail}")]
pub struct CapabilityDenied {
    pub kind: CapabilityKind,
    pub detail: String,
}

impl CapabilityDenied {
    pub fn new(kind: CapabilityKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Wrap into an error that can unwind through the Lua VM
    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::external(self)
    }
}

/// Raised by the execution hook when a plugin runs past its budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("execution budget of {0:?} exceeded")]
pub struct BudgetExceeded(pub Duration);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptorError {
    #[error("capabilities are already intercepted, nested plugin loads are not supported")]
    AlreadyIntercepted,
}

/// Everything that can go wrong while loading one plugin
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("plugin path has no usable file name: {0}")]
    InvalidPath(PathBuf),

    #[error("failed to read plugin source: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Denied(CapabilityDenied),

    #[error(transparent)]
    BudgetExceeded(BudgetExceeded),

    #[error(transparent)]
    Interceptor(#[from] InterceptorError),

    #[error("attribute {attribute} ({type_name}) cannot be converted to a string safely")]
    Metadata {
        attribute: &'static str,
        type_name: &'static str,
    },

    #[error("plugin raised an error: {0}")]
    Lua(mlua::Error),
}

impl LoadError {
    /// The denied capability, if this failure was a policy denial
    pub fn denied(&self) -> Option<&CapabilityDenied> {
        match self {
            LoadError::Denied(denied) => Some(denied),
            _ => None,
        }
    }
}

impl From<mlua::Error> for LoadError {
    fn from(err: mlua::Error) -> Self {
        if let Some(denied) = find_external::<CapabilityDenied>(&err) {
            return LoadError::Denied(denied.clone());
        }
        if let Some(budget) = find_external::<BudgetExceeded>(&err) {
            return LoadError::BudgetExceeded(budget.clone());
        }
        if let Some(nested) = find_external::<InterceptorError>(&err) {
            return LoadError::Interceptor(nested.clone());
        }
        LoadError::Lua(err)
    }
}

/// Walk callback and context wrappers down to an external error of type `T`
pub(crate) fn find_external<T: std::error::Error + 'static>(err: &mlua::Error) -> Option<&T> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<T>(),
        mlua::Error::CallbackError { cause, .. } => find_external(cause),
        mlua::Error::WithContext { cause, .. } => find_external(cause),
        _ => None,
    }
}
