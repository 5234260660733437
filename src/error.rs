//! Error types for runtime kernel compilation and launch.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while compiling, loading, or launching a shader.
///
/// Every variant is fatal within this crate: there is no retry or degraded
/// mode. A step that fails never yields a usable module or function handle,
/// so callers cannot accidentally launch against a half-built shader.
#[derive(Error, Debug)]
pub enum ShaderError {
    /// The kernel source file could not be read. The compiler is never
    /// invoked in this case.
    #[error("failed to read kernel source {path:?}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// NVRTC reported a compile failure. Carries the full program log.
    #[error("kernel compilation failed for '{name}':\n{log}")]
    Compile { name: String, log: String },

    /// The device refused to load the compiled PTX (e.g. binary/architecture
    /// mismatch).
    #[error("failed to load compiled module: {reason}")]
    ModuleLoad { reason: String },

    /// A launch requested an entry point that does not exist in the module.
    #[error("kernel function '{name}' not found in module")]
    SymbolNotFound { name: String },

    /// The device rejected the launch parameters.
    #[error("kernel launch failed '{kernel}': {reason}")]
    Launch { kernel: String, reason: String },
}
