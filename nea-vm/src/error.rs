//! Sandbox error types
//!
//! Re-exports nea-error and provides the constructors the interpreter uses
//! for Python-style exceptions.

// Re-export the core error types
pub use nea_error::{Error, ErrorKind, ErrorStatus, Result};

// =============================================================================
// Interpreter error constructors
// =============================================================================

/// Create a SyntaxError at the given line
pub fn syntax(message: impl Into<String>, line: usize) -> Error {
    Error::new(ErrorKind::Syntax, message)
        .with_operation("sandbox::parse")
        .with_context("line", line.to_string())
}

/// Create a NameError
pub fn name_error(name: &str) -> Error {
    Error::new(ErrorKind::Name, format!("name '{}' is not defined", name))
        .with_context("name", name)
}

/// Create a TypeError
pub fn type_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Type, message)
}

/// Create a ValueError
pub fn value_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Value, message)
}

/// Create a ZeroDivisionError
pub fn zero_division(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::ZeroDivision, message)
}

/// Create an IndexError
pub fn index_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Index, message)
}

/// Create a KeyError; the message is the key's repr, as Python prints it
pub fn key_error(key_repr: impl Into<String>) -> Error {
    Error::new(ErrorKind::Key, key_repr)
}

/// Create an AttributeError
pub fn attribute_error(type_name: &str, attr: &str) -> Error {
    Error::new(
        ErrorKind::Attribute,
        format!("'{}' object has no attribute '{}'", type_name, attr),
    )
}

/// Create an OverflowError
pub fn overflow(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Overflow, message)
}

/// Create an InterpreterError for something the sandbox refuses to do
pub fn forbidden(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Forbidden, message).with_operation("sandbox::execute")
}

/// Create an InterpreterError for a disallowed import
pub fn forbidden_import(module: &str, allowed: &[&str]) -> Error {
    forbidden(format!(
        "import of '{}' is not allowed. Authorized imports are: {:?}",
        module, allowed
    ))
    .with_context("module", module)
}

/// Create an InterpreterError for rebinding a reserved name
pub fn reserved_assignment(name: &str, what: &str) -> Error {
    forbidden(format!(
        "cannot assign to name '{}': doing this would erase the existing {}",
        name, what
    ))
    .with_context("name", name)
}
