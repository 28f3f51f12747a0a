//! Tools that ship with nea.

use crate::error::Result;
use crate::tool::{ParamSpec, ParamType, Tool, ToolArgs, ToolRegistry, ToolSpec};
use anyhow::Context;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;

/// Asks a human a question and returns their one-line answer
pub struct UserInput {
    reader: Mutex<Box<dyn BufRead + Send>>,
}

impl UserInput {
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(std::io::stdin()))
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Box::new(reader)),
        }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new("user_input", "Asks for user's input on a specific question")
            .param(ParamSpec::required(
                "question",
                ParamType::String,
                "The question to ask the user",
            ))
            .with_output(ParamType::String)
    }
}

impl Tool for UserInput {
    fn call(&self, args: &ToolArgs) -> anyhow::Result<Value> {
        let question = args.get("question").and_then(Value::as_str).unwrap_or("");
        let mut stderr = std::io::stderr();
        write!(stderr, "{} => ", question).context("failed to write question")?;
        stderr.flush().ok();

        let mut line = String::new();
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        let read = reader.read_line(&mut line).context("failed to read user input")?;
        anyhow::ensure!(read > 0, "no input available: stdin is closed");
        Ok(Value::String(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Register the built-in interactive tools
pub fn register_interactive(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(UserInput::spec(), UserInput::stdin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_user_input_reads_one_line() {
        let registry = ToolRegistry::new()
            .with(UserInput::spec(), UserInput::from_reader(Cursor::new("blue\nred\n")))
            .unwrap();
        let args = json!({"question": "favourite colour?"}).as_object().cloned().unwrap();
        assert_eq!(registry.invoke("user_input", &args).unwrap(), json!("blue"));
        assert_eq!(registry.invoke("user_input", &args).unwrap(), json!("red"));

        let err = registry.invoke("user_input", &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecution);
        assert!(err.message().contains("stdin is closed"));
    }
}
