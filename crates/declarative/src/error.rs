//! Error types for graph building, provisioning, and state persistence.
//!
//! Errors fall into two families. Build-time errors ([`BuildError`],
//! [`ParseError`]) abort a run before any remote mutation happens. Run-time
//! errors ([`ProviderError`], [`NodeError`]) are local to one node and its
//! descendants and end up in the run report instead of aborting the run.
//! [`EngineError`] is what the engine entry points return when a run cannot
//! start or an internal invariant breaks.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors detected while building the dependency graph.
///
/// All of these are fatal and are reported before any provider is called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Two descriptors share a logical name
    #[error("duplicate resource name: {name}")]
    DuplicateName {
        /// The name declared more than once
        name: String,
    },

    /// The dependency edges contain a cycle
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected {
        /// Node sequence of the cycle, first node repeated at the end
        cycle: Vec<String>,
    },

    /// A reference or explicit dependency names a resource that does not exist
    #[error("{from} references unknown resource '{to}'")]
    DanglingReference {
        /// The resource (or `exports.<name>`) holding the reference
        from: String,
        /// The missing resource name
        to: String,
    },
}

/// Errors parsing `${...}` placeholders in declared string values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The placeholder body is not `resource[.path][ ?? fallback]`
    #[error("invalid reference '${{{expr}}}': {reason}")]
    InvalidReference {
        /// The text between `${` and `}`
        expr: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Error carried by a failed output cell.
///
/// Derived cells fail with a clone of their source's error, so the
/// `resource` field always points at the node that originally failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{resource}: {message}")]
pub struct CellError {
    /// Resource whose failure caused this cell to fail
    pub resource: String,
    /// Description of the failure
    pub message: String,
}

impl CellError {
    /// Create a new cell error.
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// A settled output cell was asked to settle again.
///
/// This is an engine bug, never a user error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("output cell '{label}' settled twice (already {state})")]
pub struct DoubleResolution {
    /// Label of the offending cell
    pub label: String,
    /// State the cell was already in
    pub state: &'static str,
}

/// Classification of provider failures for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rate limiting, timeouts, flaky network - worth retrying
    Transient,
    /// The remote API rejected the request - retrying will not help
    Permanent,
    /// The run was cancelled while the call was in flight
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind of error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    /// Whether the failure is transient or permanent
    pub kind: ErrorKind,
    /// Message from the remote system
    pub message: String,
}

impl ProviderError {
    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// The call stopped because the run was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// Whether the call stopped because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Whether the retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Failure to substitute a reference with a producer's output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The producer has not produced outputs
    #[error("reference {reference}: producer has no outputs")]
    Unavailable {
        /// The reference as written
        reference: String,
    },

    /// The producer's outputs lack the referenced field and no fallback was given
    #[error("reference {reference}: field not present in outputs")]
    MissingField {
        /// The reference as written
        reference: String,
    },

    /// The producer's output cell failed
    #[error("reference {reference}: {source}")]
    Failed {
        /// The reference as written
        reference: String,
        /// Error of the failed cell
        source: CellError,
    },
}

/// Terminal error of a single node in a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The provider failed permanently, or transiently until retries ran out
    #[error("{error} (after {attempts} attempt(s))")]
    Provider {
        /// Last error returned by the provider
        error: ProviderError,
        /// Number of provider calls made
        attempts: u32,
    },

    /// A reference could not be substituted, the provider was never called
    #[error(transparent)]
    UnresolvedReference(#[from] ResolveError),

    /// A node this one depends on failed, so this one was never attempted
    #[error("dependency '{dependency}' failed (root cause: {root})")]
    DependencyFailed {
        /// Direct predecessor whose failure blocked this node
        dependency: String,
        /// Node where the failure originated
        root: String,
    },
}

impl NodeError {
    /// Whether this node was skipped because of another node's failure.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::DependencyFailed { .. })
    }

    /// Whether the provider call was cut short by cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Provider { error, .. } if error.is_cancelled())
    }
}

/// Errors reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state file exists but could not be read
    #[error("failed to read state file {path}: {source}")]
    Read {
        /// Path of the state file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The state file could not be written
    #[error("failed to write state file {path}: {source}")]
    Write {
        /// Path of the state file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The state file is not valid JSON for this schema
    #[error("state file {path} is not valid: {source}")]
    Parse {
        /// Path of the state file
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// The snapshot could not be serialized
    #[error("failed to serialize state: {0}")]
    Serialize(serde_json::Error),

    /// The state file was written by an incompatible version
    #[error("unsupported state version {found} (expected {expected})")]
    Version {
        /// Version found in the file
        found: u32,
        /// Version this build understands
        expected: u32,
    },
}

/// Errors returned by the engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The declaration does not form a valid graph
    #[error(transparent)]
    Build(#[from] BuildError),

    /// No provider handles a resource's kind
    #[error("no provider registered for resource '{resource}' of kind '{kind}'")]
    NoProvider {
        /// Resource name
        resource: String,
        /// Resource kind
        kind: String,
    },

    /// A resource pins a provider name that is not registered
    #[error("resource '{resource}' pins unknown provider '{provider}'")]
    UnknownProvider {
        /// Resource name
        resource: String,
        /// Pinned provider name
        provider: String,
    },

    /// An output cell was settled twice
    #[error(transparent)]
    DoubleResolution(#[from] DoubleResolution),

    /// Any other broken internal invariant
    #[error("engine invariant violated: {0}")]
    Invariant(String),

    /// State could not be loaded or saved
    #[error(transparent)]
    State(#[from] StateError),

    /// The worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    Pool(String),
}

/// Result type for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
