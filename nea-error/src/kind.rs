//! Error kinds for nea operations

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of error that occurred.
///
/// Kinds that surface inside a step are rendered back to the model using
/// [`ErrorKind::as_str`], so the names read like exception types
/// (`ToolExecutionError`, `NameError`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested feature or operation is not supported
    Unsupported,

    /// Invalid configuration or parameters
    ConfigInvalid,

    // =========================================================================
    // Tool registry errors
    // =========================================================================
    /// A tool with the same name is already registered
    DuplicateTool,

    /// A tool spec is malformed (bad name, bad parameter list)
    InvalidSpec,

    /// No tool registered under the requested name
    UnknownTool,

    /// Arguments do not satisfy the tool's declared parameters
    InvalidArgument,

    /// The tool itself failed
    ToolExecution,

    // =========================================================================
    // Model gateway errors
    // =========================================================================
    /// Backend could not be reached or refused to serve
    ModelUnavailable,

    /// Backend answered with something we cannot use
    ModelProtocol,

    // =========================================================================
    // Sandbox errors
    // =========================================================================
    /// Model output carried no executable block
    NoCodeProduced,

    /// Code ran past its wall-clock deadline
    ExecutionTimeout,

    /// Code could not be tokenized or parsed
    Syntax,

    /// Reference to an unbound name
    Name,

    /// Operation applied to a value of the wrong type
    Type,

    /// Right type, wrong value
    Value,

    /// Division or modulo by zero
    ZeroDivision,

    /// Sequence index out of range
    Index,

    /// Missing dict key
    Key,

    /// Unknown attribute or method on a value
    Attribute,

    /// Integer arithmetic overflowed
    Overflow,

    /// Code attempted something the sandbox forbids (imports, rebinding tools,
    /// exceeding operation limits)
    Forbidden,

    // =========================================================================
    // Run errors
    // =========================================================================
    /// The task is empty or otherwise unusable
    InvalidTask,

    /// The run used all its steps without a final answer
    StepBudgetExceeded,

    /// The run was cancelled from outside
    Cancelled,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Serialization/deserialization failed
    SerializationFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConfigInvalid => "ConfigInvalid",

            // Registry
            ErrorKind::DuplicateTool => "DuplicateToolError",
            ErrorKind::InvalidSpec => "InvalidSpecError",
            ErrorKind::UnknownTool => "UnknownToolError",
            ErrorKind::InvalidArgument => "ArgumentError",
            ErrorKind::ToolExecution => "ToolExecutionError",

            // Model
            ErrorKind::ModelUnavailable => "ModelUnavailableError",
            ErrorKind::ModelProtocol => "ModelProtocolError",

            // Sandbox
            ErrorKind::NoCodeProduced => "NoCodeProducedError",
            ErrorKind::ExecutionTimeout => "ExecutionTimeoutError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Overflow => "OverflowError",
            ErrorKind::Forbidden => "InterpreterError",

            // Run
            ErrorKind::InvalidTask => "InvalidTaskError",
            ErrorKind::StepBudgetExceeded => "StepBudgetExceededError",
            ErrorKind::Cancelled => "CancellationError",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ModelUnavailable)
    }

    /// Kinds that end a run instead of being folded into a step
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::StepBudgetExceeded
                | ErrorKind::Cancelled
                | ErrorKind::InvalidTask
                | ErrorKind::ModelUnavailable
        )
    }

    /// Kinds raised by the sandbox while evaluating model code
    pub fn is_code_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::Syntax
                | ErrorKind::Name
                | ErrorKind::Type
                | ErrorKind::Value
                | ErrorKind::ZeroDivision
                | ErrorKind::Index
                | ErrorKind::Key
                | ErrorKind::Attribute
                | ErrorKind::Overflow
                | ErrorKind::Forbidden
                | ErrorKind::ExecutionTimeout
                | ErrorKind::UnknownTool
                | ErrorKind::InvalidArgument
                | ErrorKind::ToolExecution
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
