//! Error types for the etlflow engine.
//!
//! Errors fall into a few families: validation errors raised while a step is
//! being built (before any row is processed), row-level conversion errors
//! (arity, broadcast, coercion), batch-scoped failures (transforms, stores)
//! and control-flow conditions (skip signals, cancellation).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

/// The main error type for etlflow operations.
#[derive(Debug, Error)]
pub enum EtlError {
    /// A step or graph failed validation.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A cycle was detected in a node or step graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A node produced a value whose shape does not match its outputs.
    #[error("{0}")]
    Arity(#[from] ArityError),

    /// Load inputs could not be broadcast to a common row count.
    #[error("{0}")]
    Broadcast(#[from] BroadcastError),

    /// A value could not be coerced to its declared attribute type.
    #[error("{0}")]
    Coercion(#[from] CoercionError),

    /// A user transform failed.
    #[error("{0}")]
    Transform(#[from] TransformFailure),

    /// The extract source failed.
    #[error("Extract error: {0}")]
    Extract(String),

    /// The target store rejected a write.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The metadata store is unreachable or rejected a write.
    #[error("Metadata store error: {0}")]
    Metadata(#[source] StoreError),

    /// Execution was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    /// Short machine-readable kind, used in events and failure records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::CycleDetected(_) => "CycleDetected",
            Self::Arity(_) => "ArityError",
            Self::Broadcast(_) => "BroadcastError",
            Self::Coercion(_) => "CoercionError",
            Self::Transform(_) => "TransformError",
            Self::Extract(_) => "ExtractError",
            Self::Store(_) => "StoreError",
            Self::Metadata(_) => "MetadataError",
            Self::Cancelled(_) => "Cancelled",
            Self::Internal(_) => "InternalError",
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// Returns true for errors that should abort the caller rather than be
    /// recorded as an ordinary step failure.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Metadata(_))
    }

    /// Renders the full error chain for persistence on a step run.
    ///
    /// Transform failures carry the trace captured from the user error; all
    /// other kinds walk `source()`.
    #[must_use]
    pub fn trace_text(&self) -> String {
        if let Self::Transform(failure) = self {
            return failure.trace.clone();
        }
        error_report(self)
    }
}

/// Formats an error and its `source()` chain, one cause per line.
#[must_use]
pub fn error_report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, "\nCaused by: {cause}");
        source = cause.source();
    }
    out
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-002-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a step, node or entity definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The nodes or steps involved in the error.
    pub nodes: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in a graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of nodes forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "GRAPH-002-CYCLE",
            format!("Graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for ValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            nodes: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// A node returned or yielded a value whose arity differs from its outputs.
#[derive(Debug, Clone, Error)]
#[error("Node '{node}' declares outputs {expected:?} but produced {found}")]
pub struct ArityError {
    /// The offending node.
    pub node: String,
    /// The declared output names.
    pub expected: Vec<String>,
    /// Description of what was produced.
    pub found: String,
}

impl ArityError {
    /// Creates a new arity error.
    #[must_use]
    pub fn new(node: impl Into<String>, expected: &[String], found: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            expected: expected.to_vec(),
            found: found.into(),
        }
    }
}

/// Load inputs had sequence lengths that cannot be broadcast together.
#[derive(Debug, Clone, Error)]
#[error("Cannot broadcast inputs of load '{node}': lengths {lengths:?}")]
pub struct BroadcastError {
    /// The load node.
    pub node: String,
    /// Input name to sequence length.
    pub lengths: Vec<(String, usize)>,
}

/// A value could not be converted to the declared attribute type.
#[derive(Debug, Clone, Error)]
#[error("Cannot coerce {value} to {expected} for attribute '{attribute}'")]
pub struct CoercionError {
    /// The attribute being written.
    pub attribute: String,
    /// The declared semantic type.
    pub expected: String,
    /// The rendered offending value.
    pub value: String,
}

impl CoercionError {
    /// Creates a new coercion error.
    #[must_use]
    pub fn new(
        attribute: impl Into<String>,
        expected: impl Into<String>,
        value: &serde_json::Value,
    ) -> Self {
        let mut rendered = value.to_string();
        if rendered.len() > 120 {
            rendered.truncate(117);
            rendered.push_str("...");
        }
        Self {
            attribute: attribute.into(),
            expected: expected.into(),
            value: rendered,
        }
    }
}

/// A transform raised a non-skip error while processing a batch.
#[derive(Debug, Clone, Error)]
#[error("Transform '{node}' failed: {message}")]
pub struct TransformFailure {
    /// The transform node name.
    pub node: String,
    /// The top-level error message.
    pub message: String,
    /// The full error chain (and backtrace, when captured).
    pub trace: String,
}

/// What a user transform function returns on the error path.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Skip the current row; remaining nodes are not run for it.
    #[error("row skipped: {0}")]
    Skip(String),

    /// The transform failed; this aborts the containing batch.
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

impl TransformError {
    /// Creates a skip signal.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Creates a failure from a message.
    #[must_use]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }
}

impl From<anyhow::Error> for TransformError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

/// Errors raised by the target or metadata stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A row referenced a parent key that does not exist.
    #[error("Foreign key violation on {table}.{column}: value {value} is not present")]
    ForeignKeyViolation {
        /// The table being written.
        table: String,
        /// The foreign-key column.
        column: String,
        /// The dangling value (rendered as text).
        value: String,
    },

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A statement failed.
    #[error("Query failed: {0}")]
    Query(String),

    /// The requested table is not known to the store.
    #[error("Unknown table: {0}")]
    UnknownTable(String),
}

/// Provides default suggestions for common contract error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "GRAPH-001-MISSING_ARG" => Some(
                "An input references a node that is not part of the step. \
                 Did you add all transforms to the step?",
            ),
            "GRAPH-002-CYCLE" => Some(
                "Check node wiring or step dependencies for circular references.",
            ),
            "GRAPH-003-DUPLICATE_OUTPUT" => Some(
                "Each output name may only be declared once per node.",
            ),
            "STEP-001-NAME" => Some(
                "Step names start with a letter and contain only letters, digits, '_' or '-'.",
            ),
            "STEP-002-DUPLICATE" => Some("Step names must be unique within a model."),
            "ENTITY-001-IDENTIFYING" => Some(
                "Wire every identifying attribute and foreign key into the load, \
                 or supply an explicit key.",
            ),
            _ => None,
        }
    }
}
