//! Agent implementation - drives the model <-> sandbox loop

use crate::config::AgentConfig;
use crate::monitor::{RunMonitor, StepObserver};
use nea_vm::prompt::{self, END_PLAN};
use nea_vm::{
    extract_code, ChatMessage, CodeExecutor, Error, ErrorKind, ExtractedCode, LlmProvider,
    ModelGateway, ModelOutput, Plan, RaisedError, Result, SandboxState, Step, StepOutcome, Task,
    ToolRegistry, Transcript, Usage,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Extra time given to a blocking execution after its own deadline
const EXECUTION_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Run result
// =============================================================================

/// How a run ended
#[derive(Debug)]
pub enum RunStatus {
    Success { value: Value },
    Failed { reason: Error },
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub transcript: Transcript,
    pub monitor: RunMonitor,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success { .. })
    }

    /// The final answer, if the run succeeded
    pub fn value(&self) -> Option<&Value> {
        match &self.status {
            RunStatus::Success { value } => Some(value),
            RunStatus::Failed { .. } => None,
        }
    }

    /// Why the run failed
    pub fn reason(&self) -> Option<&Error> {
        match &self.status {
            RunStatus::Success { .. } => None,
            RunStatus::Failed { reason } => Some(reason),
        }
    }
}

// =============================================================================
// States
// =============================================================================

/// Loop states. `Done` and `Failed` are terminal.
#[derive(Debug)]
enum RunState {
    Init,
    Planning,
    Executing {
        prompt: Vec<ChatMessage>,
        output: ModelOutput,
        started: Instant,
    },
    Evaluating(Step),
    Done(Value),
    Failed(Error),
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Planning => "planning",
            RunState::Executing { .. } => "executing",
            RunState::Evaluating(_) => "evaluating",
            RunState::Done(_) => "done",
            RunState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable per-run data. Never shared between runs.
struct Run {
    transcript: Transcript,
    sandbox: SandboxState,
    monitor: RunMonitor,
    max_steps: usize,
    step_timeout: Duration,
}

// =============================================================================
// Agent
// =============================================================================

/// The agent orchestrator. One agent can serve many concurrent runs.
pub struct Agent<P> {
    gateway: ModelGateway<P>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    observers: Vec<Box<dyn StepObserver>>,
}

impl<P: LlmProvider> Agent<P> {
    /// Create an agent with the default configuration
    pub fn new(provider: P, tools: Arc<ToolRegistry>) -> Self {
        let config = AgentConfig::default();
        Self {
            gateway: ModelGateway::new(provider).with_config(config.gateway.clone()),
            tools,
            config,
            observers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.gateway = self.gateway.with_config(config.gateway.clone());
        self.config = config;
        self
    }

    /// Register a callback invoked after each step
    pub fn with_observer(mut self, observer: impl StepObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ModelGateway<P> {
        &self.gateway
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run a task with the configured step budget and timeout
    pub async fn run_task(&self, task: impl Into<Task>) -> RunResult {
        self.run(task, self.config.max_steps, self.config.step_timeout)
            .await
    }

    /// Run a task until a final answer, a fatal error, or `max_steps` steps
    pub async fn run(
        &self,
        task: impl Into<Task>,
        max_steps: usize,
        step_timeout: Duration,
    ) -> RunResult {
        self.drive(task.into(), max_steps, step_timeout, CancellationToken::new())
            .await
    }

    /// Like [`Agent::run_task`], stopping at the next step boundary once
    /// `cancel` fires
    pub async fn run_cancellable(
        &self,
        task: impl Into<Task>,
        cancel: CancellationToken,
    ) -> RunResult {
        self.drive(
            task.into(),
            self.config.max_steps,
            self.config.step_timeout,
            cancel,
        )
        .await
    }

    async fn drive(
        &self,
        task: Task,
        max_steps: usize,
        step_timeout: Duration,
        cancel: CancellationToken,
    ) -> RunResult {
        let span = info_span!("run", max_steps, tools = self.tools.len());
        let mut run = Run {
            transcript: Transcript::new(task),
            sandbox: SandboxState::new(),
            monitor: RunMonitor::new(),
            max_steps,
            step_timeout,
        };

        let outcome = async {
            let mut state = RunState::Init;
            loop {
                debug!(state = %state, step = run.transcript.len() + 1, "transition");
                state = match state {
                    RunState::Init => self.init(&mut run),
                    RunState::Planning => self.plan(&mut run, &cancel).await,
                    RunState::Executing {
                        prompt,
                        output,
                        started,
                    } => {
                        self.execute(&mut run, prompt, output, started, &cancel)
                            .await
                    }
                    RunState::Evaluating(step) => self.evaluate(&mut run, step),
                    RunState::Done(value) => break Ok(value),
                    RunState::Failed(reason) => break Err(reason),
                };
            }
        }
        .instrument(span)
        .await;

        let status = match outcome {
            Ok(value) => {
                info!(steps = run.transcript.len(), "run finished with a final answer");
                RunStatus::Success { value }
            }
            Err(reason) => {
                error!(steps = run.transcript.len(), reason = %reason, "run failed");
                RunStatus::Failed { reason }
            }
        };
        RunResult {
            status,
            transcript: run.transcript,
            monitor: run.monitor,
        }
    }

    // =========================================================================
    // States
    // =========================================================================

    fn init(&self, run: &mut Run) -> RunState {
        if run.max_steps == 0 {
            return RunState::Failed(Error::config_invalid("max_steps must be at least 1"));
        }
        if self.config.planning_interval == Some(0) {
            return RunState::Failed(Error::config_invalid(
                "planning_interval must be at least 1",
            ));
        }
        if let Err(e) = run.transcript.task().validate_for(&self.tools) {
            return RunState::Failed(e);
        }
        run.sandbox = SandboxState::new().with_variables(run.transcript.task().attachments.clone());
        info!(
            attachments = run.transcript.task().attachments.len(),
            "run started"
        );
        RunState::Planning
    }

    async fn plan(&self, run: &mut Run, cancel: &CancellationToken) -> RunState {
        if cancel.is_cancelled() {
            return RunState::Failed(Error::cancelled("planning"));
        }
        if matches!(self.config.planning_interval, Some(n) if run.transcript.len() % n == 0) {
            match self.update_plan(run, cancel).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::ModelProtocol => {
                    warn!(error = %e, "planning reply unusable, keeping the previous plan");
                }
                Err(e) => return RunState::Failed(e),
            }
        }
        let started = Instant::now();
        let system_prompt = self.config.system_prompt.render(&self.tools);
        let prompt = run.transcript.render(&system_prompt, &self.config.render);
        debug!(
            step = run.transcript.len() + 1,
            messages = prompt.len(),
            "rendered transcript"
        );

        let stop = self.gateway.config().stop.clone();
        match self.complete_with_retry(&prompt, stop, cancel).await {
            Ok(output) => {
                run.monitor.record_completion(&output.model, &output.usage);
                RunState::Executing {
                    prompt,
                    output,
                    started,
                }
            }
            Err(e) if e.kind() == ErrorKind::ModelProtocol => {
                RunState::Evaluating(Step {
                    index: run.transcript.len() + 1,
                    prompt,
                    model_output: e.context_value("raw_output").map(str::to_string),
                    code: None,
                    ignored_blocks: Vec::new(),
                    outcome: StepOutcome::Failed(RaisedError::from(&e)),
                    usage: None,
                    duration: started.elapsed(),
                })
            }
            Err(e) => RunState::Failed(e),
        }
    }

    /// Survey the facts and write a plan for the coming steps. The first
    /// survey sees only the task; later ones see the transcript so far.
    async fn update_plan(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let before_step = run.transcript.len() + 1;
        let task = run.transcript.task().text.clone();
        let remaining = run.max_steps.saturating_sub(run.transcript.len());

        let (facts_view, history) = if run.transcript.is_empty() {
            (prompt::facts_messages(&task), None)
        } else {
            let mut history = run.transcript.render("", &self.config.render);
            history.remove(0);
            (prompt::facts_update_messages(&history), Some(history))
        };
        let facts = self.complete_with_retry(&facts_view, Vec::new(), cancel).await?;
        run.monitor.record_completion(&facts.model, &facts.usage);

        let plan_view = match &history {
            None => prompt::plan_messages(&task, &self.tools, &facts.text),
            Some(history) => {
                prompt::plan_update_messages(&task, &self.tools, &facts.text, remaining, history)
            }
        };
        let plan = self
            .complete_with_retry(&plan_view, vec![END_PLAN.to_string()], cancel)
            .await?;
        run.monitor.record_completion(&plan.model, &plan.usage);

        info!(step = before_step, initial = history.is_none(), "plan updated");
        run.transcript.record_plan(Plan {
            before_step,
            facts: facts.text,
            plan: plan.text.replace(END_PLAN, ""),
            usage: Some(Usage::new(
                facts.usage.prompt_tokens + plan.usage.prompt_tokens,
                facts.usage.completion_tokens + plan.usage.completion_tokens,
            )),
            duration: started.elapsed(),
        });
        Ok(())
    }

    async fn complete_with_retry(
        &self,
        prompt: &[ChatMessage],
        stop: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput> {
        let policy = self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .gateway
                .complete_with_stop(prompt, &self.tools, stop.clone())
                .await
            {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.backoff_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "model unavailable, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::cancelled("planning")),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(e.with_context("attempts", attempt.to_string()));
                }
            }
        }
    }

    async fn execute(
        &self,
        run: &mut Run,
        prompt: Vec<ChatMessage>,
        output: ModelOutput,
        started: Instant,
        cancel: &CancellationToken,
    ) -> RunState {
        if cancel.is_cancelled() {
            return RunState::Failed(Error::cancelled("executing"));
        }
        let index = run.transcript.len() + 1;
        let (code, ignored_blocks, outcome) = match extract_code(&output.text) {
            Ok(ExtractedCode { code, ignored }) => {
                if !ignored.is_empty() {
                    warn!(step = index, ignored = ignored.len(), "extra code blocks ignored");
                }
                debug!(step = index, code = %code, "executing code");
                let outcome = self.run_code(run, code.clone()).await;
                (Some(code), ignored, outcome)
            }
            Err(e) => (None, Vec::new(), StepOutcome::Failed(RaisedError::from(&e))),
        };

        let step = Step {
            index,
            prompt,
            model_output: Some(output.text),
            code,
            ignored_blocks,
            outcome,
            usage: Some(output.usage),
            duration: started.elapsed(),
        };
        RunState::Evaluating(step)
    }

    /// Execute on the blocking pool, moving the sandbox state in and out
    async fn run_code(&self, run: &mut Run, code: String) -> StepOutcome {
        let executor = CodeExecutor::new(Arc::clone(&self.tools))
            .with_limits(self.config.limits.with_timeout(run.step_timeout));
        let snapshot = run.sandbox.clone();
        let mut state = std::mem::take(&mut run.sandbox);
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = executor.execute(&code, &mut state);
            (outcome, state)
        });

        match tokio::time::timeout(run.step_timeout + EXECUTION_GRACE, handle).await {
            Ok(Ok((outcome, state))) => {
                run.sandbox = state;
                StepOutcome::Executed(outcome)
            }
            Ok(Err(join)) => {
                error!(error = %join, "code execution aborted, sandbox state rolled back");
                run.sandbox = snapshot;
                StepOutcome::Failed(RaisedError::from(Error::unexpected(format!(
                    "code execution aborted: {}",
                    join
                ))))
            }
            Err(_) => {
                warn!(
                    timeout_ms = run.step_timeout.as_millis() as u64,
                    "code execution did not yield, sandbox state rolled back"
                );
                run.sandbox = snapshot;
                StepOutcome::Failed(RaisedError::from(Error::execution_timeout(
                    run.step_timeout.as_millis(),
                )))
            }
        }
    }

    fn evaluate(&self, run: &mut Run, step: Step) -> RunState {
        match step.error() {
            Some(err) => warn!(step = step.index, error = %err, "step failed"),
            None => info!(step = step.index, final_answer = step.is_final(), "step completed"),
        }
        let answer = step.final_answer().cloned();

        run.monitor.record_step(&step);
        for observer in &self.observers {
            observer.on_step(&step);
        }
        run.transcript.append(step);

        match answer {
            Some(value) => RunState::Done(value),
            None if run.transcript.len() >= run.max_steps => {
                RunState::Failed(Error::step_budget_exceeded(run.max_steps))
            }
            None => RunState::Planning,
        }
    }
}

impl<P> fmt::Debug for Agent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("tools", &self.tools.len())
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use nea_vm::{ScriptedProvider, ScriptedReply};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_retry() -> AgentConfig {
        AgentConfig::default().with_retry(
            RetryPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn agent(replies: Vec<ScriptedReply>) -> Agent<ScriptedProvider> {
        Agent::new(ScriptedProvider::new(replies), Arc::new(ToolRegistry::new()))
            .with_config(fast_retry())
    }

    fn code(body: &str) -> ScriptedReply {
        ScriptedReply::Text(format!("Thought: go\nCode:\n```py\n{}\n```<end_code>", body))
    }

    #[tokio::test]
    async fn test_variables_persist_between_steps() {
        let agent = agent(vec![code("x = 20"), code("final_answer(x + 1)")]);
        let result = agent.run("add one", 5, Duration::from_secs(5)).await;

        assert!(result.is_success());
        assert_eq!(result.value(), Some(&json!(21)));
        assert_eq!(result.transcript.len(), 2);
        assert_eq!(result.monitor.step_durations.len(), 2);
        assert_eq!(result.monitor.usage.total_calls, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let agent = agent(vec![
            ScriptedReply::Unavailable("503".into()),
            ScriptedReply::Unavailable("503".into()),
            code("final_answer('ok')"),
        ]);
        let result = agent.run_task("retry").await;

        assert_eq!(result.value(), Some(&json!("ok")));
        assert_eq!(result.transcript.len(), 1);
        assert_eq!(agent.gateway().provider().calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_run() {
        let provider =
            ScriptedProvider::new(vec![ScriptedReply::Unavailable("down".into())]).repeat_last();
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()))
            .with_config(fast_retry().with_retry(
                RetryPolicy::default()
                    .with_max_retries(2)
                    .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
            ));
        let result = agent.run_task("nothing works").await;

        let reason = result.reason().unwrap();
        assert_eq!(reason.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(reason.context_value("attempts"), Some("3"));
        assert!(result.transcript.is_empty());
        assert_eq!(agent.gateway().provider().calls(), 3);
    }

    #[tokio::test]
    async fn test_protocol_error_becomes_step() {
        let agent = agent(vec![
            ScriptedReply::Malformed("bad json".into()),
            code("final_answer(1)"),
        ]);
        let result = agent.run_task("protocol").await;

        assert!(result.is_success());
        let first = &result.transcript.steps()[0];
        assert_eq!(first.error().unwrap().kind, ErrorKind::ModelProtocol);
        assert_eq!(first.model_output.as_deref(), Some("bad json"));
    }

    #[tokio::test]
    async fn test_invalid_task_fails_before_model_call() {
        let agent = agent(vec![code("final_answer(1)")]);
        let result = agent.run_task("   ").await;

        assert_eq!(result.reason().unwrap().kind(), ErrorKind::InvalidTask);
        assert!(result.transcript.is_empty());
        assert_eq!(agent.gateway().provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_step_budget_is_rejected() {
        let agent = agent(vec![code("final_answer(1)")]);
        let result = agent.run("task", 0, Duration::from_secs(1)).await;
        assert_eq!(result.reason().unwrap().kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn test_attachments_are_bound() {
        let agent = agent(vec![code("final_answer(len(docs))")]);
        let task = Task::new("count docs").with_attachment("docs", json!(["a", "b", "c"]));
        let result = agent.run_task(task).await;
        assert_eq!(result.value(), Some(&json!(3)));

        let prompt = &agent.gateway().provider().requests()[0].messages;
        assert!(prompt[1].text().contains("docs"));
    }

    #[tokio::test]
    async fn test_observers_see_every_step() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let agent = agent(vec![code("print('a')"), code("final_answer(2)")])
            .with_observer(move |_: &Step| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let result = agent.run_task("observe").await;

        assert!(result.is_success());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_boundary() {
        let agent = agent(vec![code("x = 1")]);
        let token = CancellationToken::new();
        token.cancel();
        let result = agent.run_cancellable("cancel me", token).await;

        let reason = result.reason().unwrap();
        assert_eq!(reason.kind(), ErrorKind::Cancelled);
        assert_eq!(reason.context_value("state"), Some("planning"));
        assert_eq!(agent.gateway().provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_planning_interval_records_plans() {
        let agent = agent(vec![
            ScriptedReply::Text("### 1. Facts given in the task\nnone".into()),
            ScriptedReply::Text("1. set x\n2. answer\n<end_plan>".into()),
            code("x = 1"),
            code("x = x + 1"),
            ScriptedReply::Text("### 2. Facts that we have learned\nx is 2".into()),
            ScriptedReply::Text("1. answer with x".into()),
            code("final_answer(x)"),
        ])
        .with_config(fast_retry().with_planning_interval(2));
        let result = agent.run("plan then act", 4, Duration::from_secs(5)).await;

        assert_eq!(result.value(), Some(&json!(2)));
        assert_eq!(result.transcript.len(), 3);
        let plans = result.transcript.plans();
        assert_eq!(plans.len(), 2);
        assert_eq!((plans[0].before_step, plans[1].before_step), (1, 3));
        assert_eq!(plans[0].plan.trim(), "1. set x\n2. answer");
        assert_eq!(result.monitor.usage.total_calls, 7);

        let requests = agent.gateway().provider().requests();
        assert_eq!(requests[0].stop, None);
        assert_eq!(requests[1].stop, Some(vec!["<end_plan>".to_string()]));
        let facts_update = &requests[4].messages;
        assert!(facts_update.iter().any(|m| m.text().starts_with("Observation:")));
        let plan_update = requests[5].messages.last().unwrap().text();
        assert!(plan_update.contains("you have 2 steps remaining"));

        let first_prompt = &result.transcript.steps()[0].prompt;
        assert!(first_prompt.last().unwrap().text().contains("1. set x"));
    }

    #[tokio::test]
    async fn test_zero_planning_interval_is_rejected() {
        let agent = agent(vec![code("final_answer(1)")])
            .with_config(fast_retry().with_planning_interval(0));
        let result = agent.run_task("task").await;
        assert_eq!(result.reason().unwrap().kind(), ErrorKind::ConfigInvalid);
        assert_eq!(agent.gateway().provider().calls(), 0);
    }

    #[tokio::test]
    async fn test_overflow_keeps_earlier_bindings() {
        let agent = agent(vec![
            code("keep = 41"),
            code("pairs = enumerate([1, 2], 9223372036854775807)"),
            code("final_answer(keep + 1)"),
        ]);
        let result = agent.run("overflow", 5, Duration::from_secs(5)).await;

        assert_eq!(result.value(), Some(&json!(42)));
        let second = &result.transcript.steps()[1];
        assert_eq!(second.error().unwrap().kind, ErrorKind::Overflow);
    }

    #[tokio::test]
    async fn test_aborted_execution_rolls_back_state() {
        let tools = ToolRegistry::new()
            .with(
                nea_vm::ToolSpec::new("explode", "Always panics"),
                nea_vm::tool_fn(|_| -> anyhow::Result<Value> { panic!("tool blew up") }),
            )
            .unwrap();
        let provider = ScriptedProvider::new(vec![
            code("keep = 41"),
            code("keep = 0
explode()"),
            code("final_answer(keep + 1)"),
        ]);
        let agent = Agent::new(provider, Arc::new(tools)).with_config(fast_retry());
        let result = agent.run("panic", 5, Duration::from_secs(5)).await;

        assert_eq!(result.value(), Some(&json!(42)));
        let second = &result.transcript.steps()[1];
        assert_eq!(second.error().unwrap().kind, ErrorKind::Unexpected);
    }

    #[tokio::test]
    async fn test_execution_timeout_is_a_step_error() {
        let provider = ScriptedProvider::new(vec![
            code("while True:\n    pass"),
            code("final_answer('recovered')"),
        ]);
        let limits = nea_vm::SandboxLimits::default()
            .with_max_operations(u64::MAX)
            .with_max_while_iterations(u64::MAX);
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()))
            .with_config(fast_retry().with_limits(limits));
        let result = agent.run("spin", 3, Duration::from_millis(50)).await;

        assert_eq!(result.value(), Some(&json!("recovered")));
        let first = &result.transcript.steps()[0];
        assert_eq!(first.error().unwrap().kind, ErrorKind::ExecutionTimeout);
    }
}
