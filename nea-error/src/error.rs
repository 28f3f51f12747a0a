//! The main Error type for nea

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// The unified error type for all nea operations.
///
/// This error type provides:
/// - `kind`: What type of error occurred
/// - `message`: Human-readable description
/// - `status`: Whether the error is retryable
/// - `operation`: What operation caused the error
/// - `context`: Key-value pairs for debugging
/// - `source`: The underlying error (if any)
///
/// # Example
///
/// ```rust
/// use nea_error::{Error, ErrorKind, ErrorStatus};
///
/// let err = Error::new(ErrorKind::ModelUnavailable, "connection refused")
///     .with_operation("gateway::complete")
///     .with_status(ErrorStatus::Temporary)
///     .with_context("model", "gpt-4o")
///     .with_context("attempt", "2");
///
/// assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
/// assert!(err.status().is_retryable());
/// ```
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    /// Create a new error with the given kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind.is_retryable() {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };

        Self {
            kind,
            message: message.into(),
            status,
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    // =========================================================================
    // Getters
    // =========================================================================

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error status
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Get the operation that caused this error
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Get the context key-value pairs
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the source error (if any)
    pub fn source_ref(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    // =========================================================================
    // Builders (chainable)
    // =========================================================================

    /// Set the error status
    pub fn with_status(mut self, status: ErrorStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark as temporary (retryable)
    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Mark as permanent (not retryable)
    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the operation that caused this error.
    ///
    /// If an operation was already set, the previous one is moved to context
    /// as "called" to preserve the call chain.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the source error.
    ///
    /// # Panics (debug only)
    /// Panics in debug mode if source was already set.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(source.into());
        self
    }

    // =========================================================================
    // Status mutations
    // =========================================================================

    /// Mark as persistent after failed retries
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }

    /// Exception-style one-liner, `<Kind>: <message>`, as shown to the model.
    pub fn brief(&self) -> String {
        if self.message.is_empty() {
            self.kind.as_str().to_string()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }

    /// Look up a context value by key (first match)
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

// =============================================================================
// Display - compact, single-line format for logs
// =============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.context.is_empty() {
            write!(f, ", context {{ ")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        Ok(())
    }
}

// =============================================================================
// Debug - verbose, multi-line format for debugging
// =============================================================================

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.message.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Message: {}", self.message)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "        {}: {}", key, value)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "    Source: {:?}", source)?;
        }

        Ok(())
    }
}

// =============================================================================
// std::error::Error implementation
// =============================================================================

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Convenient From implementations (be careful not to leak raw errors!)
// =============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string())
            .with_operation("io")
            .set_source(err)
    }
}

// =============================================================================
// Convenience constructors
// =============================================================================

impl Error {
    /// Create an Unexpected error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// Create a ConfigInvalid error
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    /// Create a DuplicateTool error
    pub fn duplicate_tool(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorKind::DuplicateTool,
            format!("tool '{}' is already registered", name),
        )
        .with_context("tool", name)
    }

    /// Create an InvalidSpec error
    pub fn invalid_spec(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSpec, reason).with_context("tool", tool)
    }

    /// Create an UnknownTool error
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::UnknownTool, format!("unknown tool '{}'", name))
            .with_context("tool", name)
    }

    /// Create an ArgumentError
    pub fn invalid_argument(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message).with_context("tool", tool)
    }

    /// Create a ToolExecution error wrapping the tool's own failure.
    ///
    /// The message is the tool's message verbatim.
    pub fn tool_execution(tool: impl Into<String>, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::ToolExecution, source.to_string())
            .with_context("tool", tool)
            .set_source(source)
    }

    /// Create a ModelUnavailable error (temporary by default)
    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelUnavailable, message)
    }

    /// Create a ModelProtocol error
    pub fn model_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelProtocol, message)
    }

    /// Create a NoCodeProduced error
    pub fn no_code_produced(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoCodeProduced, message)
    }

    /// Create an ExecutionTimeout error
    pub fn execution_timeout(limit_ms: u128) -> Self {
        Self::new(
            ErrorKind::ExecutionTimeout,
            format!("code execution exceeded {} ms", limit_ms),
        )
        .with_context("limit_ms", limit_ms.to_string())
    }

    /// Create a StepBudgetExceeded error
    pub fn step_budget_exceeded(max_steps: usize) -> Self {
        Self::new(
            ErrorKind::StepBudgetExceeded,
            format!("no final answer after {} steps", max_steps),
        )
        .with_context("max_steps", max_steps.to_string())
    }

    /// Create a Cancelled error
    pub fn cancelled(at: impl Into<String>) -> Self {
        let at = at.into();
        Self::new(ErrorKind::Cancelled, format!("run cancelled before {}", at))
            .with_context("state", at)
    }

    /// Create an InvalidTask error
    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTask, message)
    }

    /// Create a SerializationFailed error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationFailed, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorStatus;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::UnknownTool, "unknown tool 'search'");
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
        assert_eq!(err.message(), "unknown tool 'search'");
        assert_eq!(err.status(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::new(ErrorKind::ModelUnavailable, "timeout")
            .with_operation("gateway::complete")
            .with_context("model", "gpt-4o")
            .with_context("attempt", "1");

        assert_eq!(err.operation(), "gateway::complete");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[0], ("model", "gpt-4o".to_string()));
        assert_eq!(err.context_value("attempt"), Some("1"));
    }

    #[test]
    fn test_operation_chaining() {
        let err = Error::new(ErrorKind::IoFailed, "write failed")
            .with_operation("transcript::save")
            .with_operation("cli::export");

        assert_eq!(err.operation(), "cli::export");
        assert_eq!(err.context().len(), 1);
        assert_eq!(err.context()[0], ("called", "transcript::save".to_string()));
    }

    #[test]
    fn test_default_status_follows_kind() {
        assert!(Error::model_unavailable("503").is_retryable());
        assert!(!Error::model_protocol("bad json").is_retryable());
        assert!(!Error::unknown_tool("nope").is_retryable());
    }

    #[test]
    fn test_persist() {
        let err = Error::model_unavailable("connection refused");
        assert!(err.is_retryable());

        let err = err.persist();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), ErrorStatus::Persistent);
    }

    #[test]
    fn test_display() {
        let err = Error::model_unavailable("model unavailable")
            .with_operation("gateway::complete")
            .with_context("model", "claude")
            .with_context("attempt", "3");

        let display = format!("{}", err);
        assert!(display.contains("ModelUnavailableError"));
        assert!(display.contains("temporary"));
        assert!(display.contains("gateway::complete"));
        assert!(display.contains("model: claude"));
    }

    #[test]
    fn test_brief() {
        let err = Error::tool_execution("search", anyhow::anyhow!("index offline"));
        assert_eq!(err.brief(), "ToolExecutionError: index offline");
        assert!(err.source_ref().is_some());
        assert_eq!(err.context_value("tool"), Some("search"));
    }

    #[test]
    fn test_convenience_constructors() {
        let err = Error::duplicate_tool("search");
        assert_eq!(err.kind(), ErrorKind::DuplicateTool);
        assert!(err.message().contains("search"));

        let err = Error::step_budget_exceeded(3);
        assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);
        assert_eq!(err.context_value("max_steps"), Some("3"));

        let err = Error::execution_timeout(250);
        assert_eq!(err.brief(), "ExecutionTimeoutError: code execution exceeded 250 ms");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert!(err.source_ref().is_some());
    }
}
