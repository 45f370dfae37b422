use std::fmt;

use crate::engine::Isolate;

/// Identifier of a bootstrap/broadcast script known to the loader.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ScriptId(String);

impl ScriptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum ScriptError {
    /// The script source could not be resolved or compiled.
    LoadFailed(String),
    /// The script ran but raised an error.
    ExecFailed(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadFailed(detail) => write!(f, "script load failed: {}", detail),
            Self::ExecFailed(detail) => write!(f, "script execution failed: {}", detail),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Loads a script into one isolate.
///
/// Consumed during context construction (bootstrap) and during
/// administrative broadcasts. A broken bootstrap makes the server unusable,
/// so the pool treats these failures as fatal.
pub trait ScriptLoader: Send + Sync {
    fn load(&self, isolate: &mut dyn Isolate, script: &ScriptId) -> Result<(), ScriptError>;
}
