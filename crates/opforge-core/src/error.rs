//! Error types for opforge.

use thiserror::Error;

/// Result type for opforge operations.
pub type Result<T> = std::result::Result<T, OpforgeError>;

/// Errors surfaced by the build, load and call entry points.
#[derive(Error, Debug)]
pub enum OpforgeError {
    /// Malformed or unbalanced declaration, duplicate or undefined template name.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based source line where the offending declaration starts.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The build manifest was written by a newer engine.
    #[error(
        "unsupported build manifest version {found} (this engine supports up to {supported}); \
         please upgrade opforge"
    )]
    Version {
        /// Version found on disk.
        found: u32,
        /// Highest version this engine understands.
        supported: u32,
    },

    /// The native compiler failed.
    #[error("build failed: {0}")]
    Build(String),

    /// An expected entry point is missing from a compiled artifact.
    #[error("symbol `{symbol}` not found in {artifact}")]
    SymbolNotFound {
        /// Hashed symbol name.
        symbol: String,
        /// Artifact path or registry scope that was searched.
        artifact: String,
    },

    /// Call arguments do not satisfy the declared signature.
    #[error(
        "unmatched parameters of `{function}`: {reason}\n\tdeclared: ({declared})\n\tsupplied: ({supplied})"
    )]
    TypeMismatch {
        /// Function name.
        function: String,
        /// Declared parameter types.
        declared: String,
        /// Supplied argument types.
        supplied: String,
        /// Which argument failed and why.
        reason: String,
    },

    /// A template parameter could not be determined, or two arguments disagree on it.
    #[error("cannot resolve template types of `{function}`: {message}")]
    TemplateResolution {
        /// Function name.
        function: String,
        /// What went wrong.
        message: String,
    },

    /// Pointer arguments reference more than one device.
    #[error("don't use multiple devices in one call to `{function}`: {first} vs {second}")]
    MultiDevice {
        /// Function name.
        function: String,
        /// Device of the first pointer argument.
        first: String,
        /// Conflicting device.
        second: String,
    },

    /// No function with this name has been bound.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// The build manifest is unreadable.
    #[error("invalid build manifest: {0}")]
    Manifest(String),

    /// A compiled artifact could not be opened.
    #[error("failed to load library: {0}")]
    Load(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpforgeError {
    /// Shorthand for a parse error at `line`.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Shorthand for a template resolution error.
    pub fn template(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateResolution {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the caller's arguments rather than the build.
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            Self::TypeMismatch { .. } | Self::TemplateResolution { .. } | Self::MultiDevice { .. }
        )
    }
}
