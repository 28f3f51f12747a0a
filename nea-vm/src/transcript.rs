//! # Transcript
//!
//! Append-only record of one run: the task, then one [`Step`] per loop
//! iteration. The transcript is the agent's whole memory; every prompt is
//! rendered from it with [`Transcript::render`], which produces a bounded
//! view without touching the record itself.

use crate::error::{Error, Result};
use crate::provider::{ChatMessage, Usage};
use crate::sandbox::{ExecutionOutcome, RaisedError};
use crate::tool::{is_identifier, is_reserved, ToolRegistry};
use crate::value::repr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// Default character budget for one rendered observation
pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 20_000;

const RETRY_HINT: &str = "Now let's retry: take care not to repeat previous errors! \
                          If you have retried several times, try a completely different approach.\n";

// =============================================================================
// Task
// =============================================================================

/// What the run was asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub text: String,
    /// Named values bound as variables before the first step
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attachments: Map<String, Value>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Map::new(),
        }
    }

    pub fn with_attachment(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attachments.insert(name.into(), value);
        self
    }

    pub fn with_attachments(mut self, attachments: Map<String, Value>) -> Self {
        self.attachments.extend(attachments);
        self
    }

    /// Reject empty tasks
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::invalid_task("task must not be empty"));
        }
        Ok(())
    }

    /// Like [`Task::validate`], and also reject attachments that are not
    /// identifiers or would shadow `final_answer`, a builtin or a tool
    pub fn validate_for(&self, tools: &ToolRegistry) -> Result<()> {
        self.validate()?;
        for name in self.attachments.keys() {
            if !is_identifier(name) {
                return Err(Error::invalid_task(format!(
                    "attachment name '{}' is not a valid identifier",
                    name
                ))
                .with_context("attachment", name.clone()));
            }
            if is_reserved(name) || tools.contains(name) {
                return Err(Error::invalid_task(format!(
                    "attachment '{}' would shadow a reserved name or tool",
                    name
                ))
                .with_context("attachment", name.clone()));
            }
        }
        Ok(())
    }

    /// The opening user message
    pub fn message(&self) -> String {
        let mut out = format!("New task:\n{}", self.text);
        if !self.attachments.is_empty() {
            out.push_str(
                "\nYou have been provided with these additional arguments, that you can \
                 access using the keys as variables in your python code:\n",
            );
            out.push_str(&repr(&Value::Object(self.attachments.clone())));
            out.push('.');
        }
        out
    }
}

impl From<&str> for Task {
    fn from(text: &str) -> Self {
        Task::new(text)
    }
}

impl From<String> for Task {
    fn from(text: String) -> Self {
        Task::new(text)
    }
}

// =============================================================================
// Step
// =============================================================================

/// How a step ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Code ran; the outcome may still carry a raised error
    Executed(ExecutionOutcome),
    /// No code ran: bad model output, protocol error or timeout
    Failed(RaisedError),
}

/// One loop iteration. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position in the transcript
    pub index: usize,
    /// Messages sent to the model
    pub prompt: Vec<ChatMessage>,
    /// Raw model reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,
    /// The block that was executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Further blocks in the reply that did not run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_blocks: Vec<String>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub duration: Duration,
}

impl Step {
    /// The error this step recorded, if any
    pub fn error(&self) -> Option<&RaisedError> {
        match &self.outcome {
            StepOutcome::Executed(outcome) => outcome.error.as_ref(),
            StepOutcome::Failed(err) => Some(err),
        }
    }

    pub fn final_answer(&self) -> Option<&Value> {
        match &self.outcome {
            StepOutcome::Executed(outcome) => outcome.final_answer.as_ref(),
            StepOutcome::Failed(_) => None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.final_answer().is_some()
    }

    /// Equality ignoring wall-clock duration
    pub fn same_content(&self, other: &Step) -> bool {
        self.index == other.index
            && self.prompt == other.prompt
            && self.model_output == other.model_output
            && self.code == other.code
            && self.ignored_blocks == other.ignored_blocks
            && self.outcome == other.outcome
            && self.usage == other.usage
    }

    /// The message fed back to the model after this step
    pub fn feedback(&self, max_chars: usize) -> String {
        let mut out = match &self.outcome {
            StepOutcome::Failed(err) => format!("Error:\n{}\n{}", err, RETRY_HINT),
            StepOutcome::Executed(outcome) => match &outcome.error {
                Some(err) => {
                    let mut msg = format!("Error:\n{}\n", err);
                    if !outcome.stdout.is_empty() {
                        msg.push_str("Execution logs:\n");
                        msg.push_str(&truncate_content(&outcome.stdout, max_chars));
                        msg.push('\n');
                    }
                    msg.push_str(RETRY_HINT);
                    msg
                }
                None => {
                    let last = outcome
                        .final_answer
                        .as_ref()
                        .or(outcome.return_value.as_ref())
                        .map(repr)
                        .unwrap_or_else(|| "None".to_string());
                    format!(
                        "Observation:\nExecution logs:\n{}\nLast output from code snippet:\n{}",
                        truncate_content(&outcome.stdout, max_chars),
                        truncate_content(&last, max_chars)
                    )
                }
            },
        };
        if !self.ignored_blocks.is_empty() {
            out.push_str(&format!(
                "\nNote: only the first code block was executed; {} further block(s) were ignored.",
                self.ignored_blocks.len()
            ));
        }
        out
    }

    fn messages(&self, max_chars: usize) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(2);
        if let Some(output) = &self.model_output {
            out.push(ChatMessage::assistant(output.trim()));
        }
        out.push(ChatMessage::user(self.feedback(max_chars)));
        out
    }
}

// =============================================================================
// Plan
// =============================================================================

/// A facts survey and plan written before an action step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Index of the step the plan was written for
    pub before_step: usize,
    pub facts: String,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub duration: Duration,
}

impl Plan {
    /// How the plan appears in later prompts
    pub fn message(&self) -> String {
        format!(
            "Here are the facts that I know so far:\n```\n{}\n```\n\n\
             Here is the plan of action that I will follow to solve the task:\n```\n{}\n```",
            self.facts.trim(),
            self.plan.trim()
        )
    }

    fn same_content(&self, other: &Plan) -> bool {
        self.before_step == other.before_step
            && self.facts == other.facts
            && self.plan == other.plan
            && self.usage == other.usage
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Bounds applied when rendering a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Keep at most this many of the most recent steps
    pub max_steps: Option<usize>,
    /// Approximate token budget for the whole view
    pub max_tokens: Option<usize>,
    pub max_observation_chars: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_steps: None,
            max_tokens: None,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
        }
    }
}

impl RenderOptions {
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = Some(max);
        self
    }

    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_max_observation_chars(mut self, max: usize) -> Self {
        self.max_observation_chars = max;
        self
    }
}

/// Rough token count: four characters per token
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.text().chars().count().div_ceil(4))
        .sum()
}

/// Keep the head and tail of overlong text
pub fn truncate_content(text: &str, max_chars: usize) -> String {
    let len = text.chars().count();
    if len <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(len - half).collect();
    format!(
        "{}\n..._This content has been truncated to stay below {} characters_...\n{}",
        head, max_chars, tail
    )
}

fn omission_marker(omitted: usize) -> ChatMessage {
    ChatMessage::user(format!(
        "[{} earlier step(s) omitted to fit the context window]",
        omitted
    ))
}

// =============================================================================
// Transcript
// =============================================================================

/// Ordered, append-only log of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    task: Task,
    steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    plans: Vec<Plan>,
}

impl Transcript {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            steps: Vec::new(),
            plans: Vec::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn append(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn record_plan(&mut self, plan: Plan) {
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn latest_plan(&self) -> Option<&Plan> {
        self.plans.last()
    }

    /// Equality ignoring step durations
    pub fn same_content(&self, other: &Transcript) -> bool {
        self.task == other.task
            && self.steps.len() == other.steps.len()
            && self
                .steps
                .iter()
                .zip(&other.steps)
                .all(|(a, b)| a.same_content(b))
            && self.plans.len() == other.plans.len()
            && self
                .plans
                .iter()
                .zip(&other.plans)
                .all(|(a, b)| a.same_content(b))
    }

    /// Build the prompt for the next model call.
    ///
    /// The system prompt and task are always kept. Oldest steps are dropped
    /// first, down to the most recent one, and a single marker message
    /// stands in for whatever was dropped. Only the latest plan is shown,
    /// just before the step it was written for.
    pub fn render(&self, system_prompt: &str, options: &RenderOptions) -> Vec<ChatMessage> {
        let head = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(self.task.message()),
        ];
        let plan = self
            .latest_plan()
            .map(|p| (p.before_step, ChatMessage::assistant(p.message())));
        let per_step: Vec<Vec<ChatMessage>> = self
            .steps
            .iter()
            .map(|s| s.messages(options.max_observation_chars))
            .collect();

        let mut start = match options.max_steps {
            Some(max) => per_step.len().saturating_sub(max),
            None => 0,
        };

        if let Some(budget) = options.max_tokens {
            let plan_tokens = plan
                .as_ref()
                .map(|(_, m)| estimate_tokens(std::slice::from_ref(m)))
                .unwrap_or(0);
            let mut total = estimate_tokens(&head)
                + plan_tokens
                + per_step[start..].iter().map(|m| estimate_tokens(m)).sum::<usize>();
            while total > budget && start + 1 < per_step.len() {
                total -= estimate_tokens(&per_step[start]);
                start += 1;
            }
        }

        let mut view = head;
        if start > 0 {
            view.push(omission_marker(start));
        }
        // Plans for omitted steps move up to the first kept one
        let mut plan = plan.map(|(before, m)| (before.saturating_sub(1).max(start), m));
        for (pos, messages) in per_step.into_iter().enumerate().skip(start) {
            if plan.as_ref().is_some_and(|(at, _)| *at == pos) {
                if let Some((_, m)) = plan.take() {
                    view.push(m);
                }
            }
            view.extend(messages);
        }
        if let Some((_, m)) = plan {
            view.push(m);
        }
        view
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::serialization(format!("failed to serialize transcript: {}", e))
                .with_operation("transcript::to_json")
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::serialization(format!("failed to parse transcript: {}", e))
                .with_operation("transcript::from_json")
        })
    }

    /// Write the transcript as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| {
            Error::from(e)
                .with_operation("transcript::save")
                .with_context("path", path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::Role;
    use serde_json::json;

    fn executed(index: usize, stdout: &str, value: Option<Value>) -> Step {
        Step {
            index,
            prompt: Vec::new(),
            model_output: Some(format!("Thought: step {}\n```py\nprint({})\n```", index, index)),
            code: Some(format!("print({})", index)),
            ignored_blocks: Vec::new(),
            outcome: StepOutcome::Executed(ExecutionOutcome {
                stdout: stdout.to_string(),
                return_value: value,
                ..Default::default()
            }),
            usage: None,
            duration: Duration::from_millis(5),
        }
    }

    fn failed(index: usize, kind: ErrorKind, message: &str) -> Step {
        Step {
            index,
            prompt: Vec::new(),
            model_output: Some("I will just answer".into()),
            code: None,
            ignored_blocks: Vec::new(),
            outcome: StepOutcome::Failed(RaisedError {
                kind,
                message: message.into(),
                line: None,
            }),
            usage: None,
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_render_seeds_system_and_task() {
        let transcript = Transcript::new(
            Task::new("add numbers").with_attachment("numbers", json!([1, 2])),
        );
        let view = transcript.render("SYSTEM", &RenderOptions::default());
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].role, Role::System);
        assert!(view[1].text().starts_with("New task:\nadd numbers"));
        assert!(view[1].text().contains("{'numbers': [1, 2]}"));
    }

    #[test]
    fn test_observation_and_error_feedback() {
        let mut transcript = Transcript::new(Task::new("t"));
        transcript.append(executed(1, "1\n", Some(json!(7))));
        transcript.append(failed(2, ErrorKind::ToolExecution, "search backend down"));

        let view = transcript.render("S", &RenderOptions::default());
        assert_eq!(view.len(), 6);
        assert_eq!(view[2].role, Role::Assistant);
        assert_eq!(
            view[3].text(),
            "Observation:\nExecution logs:\n1\n\nLast output from code snippet:\n7"
        );
        assert!(view[5]
            .text()
            .starts_with("Error:\nToolExecutionError: search backend down\nNow let's retry"));
    }

    #[test]
    fn test_render_drops_oldest_but_keeps_task_and_latest() {
        let mut transcript = Transcript::new(Task::new("long task"));
        for i in 1..=5 {
            transcript.append(executed(i, &"x".repeat(400), None));
        }

        let view = transcript.render("S", &RenderOptions::default().with_max_steps(2));
        assert_eq!(view.len(), 2 + 1 + 4);
        assert_eq!(view[2].text(), "[3 earlier step(s) omitted to fit the context window]");
        assert!(view[3].text().contains("step 4"));

        let view = transcript.render("S", &RenderOptions::default().with_max_tokens(1));
        assert_eq!(view.len(), 2 + 1 + 2);
        assert!(view[1].text().contains("long task"));
        assert!(view[3].text().contains("step 5"));

        // rendering never mutates the record
        assert_eq!(transcript.len(), 5);
    }

    fn plan(before_step: usize, text: &str) -> Plan {
        Plan {
            before_step,
            facts: "none yet".into(),
            plan: text.into(),
            usage: None,
            duration: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_latest_plan_rendered_before_its_step() {
        let mut transcript = Transcript::new(Task::new("plan it"));
        transcript.record_plan(plan(1, "1. first plan"));
        let view = transcript.render("SYSTEM", &RenderOptions::default());
        assert_eq!(view.len(), 3);
        assert_eq!(view[2].role, Role::Assistant);
        assert!(view[2].text().contains("1. first plan"));

        transcript.append(executed(1, "a", None));
        transcript.append(executed(2, "b", None));
        transcript.record_plan(plan(3, "2. revised plan"));
        transcript.append(executed(3, "c", None));
        let view = transcript.render("SYSTEM", &RenderOptions::default());
        let texts: Vec<&str> = view.iter().map(|m| m.text()).collect();
        assert!(!texts.iter().any(|t| t.contains("1. first plan")));
        let at = texts.iter().position(|t| t.contains("2. revised plan")).unwrap();
        assert_eq!(at, 2 + 4);
        assert_eq!(view.len(), 2 + 6 + 1);

        let windowed = transcript.render("SYSTEM", &RenderOptions::default().with_max_steps(1));
        assert!(windowed[3].text().contains("2. revised plan"));
        assert_eq!(transcript.plans().len(), 2);
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        let out = truncate_content(&"ab".repeat(20), 10);
        assert!(out.starts_with("ababa\n..._This content has been truncated"));
        assert!(out.ends_with("\nbabab"));
    }

    #[test]
    fn test_empty_task_is_invalid() {
        assert_eq!(
            Task::new("  \n").validate().unwrap_err().kind(),
            ErrorKind::InvalidTask
        );
        assert!(Task::new("go").validate().is_ok());
    }

    #[test]
    fn test_attachments_cannot_shadow_bindings() {
        let tools = ToolRegistry::new()
            .with(
                crate::tool::ToolSpec::new("search", "Search the web"),
                crate::tool::tool_fn(|_| Ok(json!(""))),
            )
            .unwrap();

        for name in ["final_answer", "search", "print", "math", "for", "not a name"] {
            let task = Task::new("go").with_attachment(name, json!(1));
            let err = task.validate_for(&tools).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTask, "{}", name);
            assert_eq!(err.context_value("attachment"), Some(name));
        }
        let ok = Task::new("go").with_attachment("docs", json!(["a"]));
        assert!(ok.validate_for(&tools).is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let mut transcript = Transcript::new(Task::new("persist me"));
        transcript.append(executed(1, "", Some(json!({"a": 1}))));
        transcript.append(failed(2, ErrorKind::NoCodeProduced, "no code"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        transcript.save(&path).unwrap();

        let loaded = Transcript::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, transcript);
    }
}
