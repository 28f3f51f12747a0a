//! End-to-end runs against a scripted model

use nea_agent::{Agent, AgentConfig, CancellationToken, RunStatus};
use nea_vm::transcript::DEFAULT_MAX_OBSERVATION_CHARS;
use nea_vm::{
    tool_fn, CompletionRequest, CompletionResponse, ErrorKind, LlmProvider, ParamSpec, ParamType,
    ProviderError, Role, ScriptedProvider, ScriptedReply, StreamReceiver, Task, ToolRegistry,
    ToolSpec, Transcript,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn code(body: &str) -> String {
    format!("Thought: next step.\nCode:\n```py\n{}\n```<end_code>", body)
}

fn agent(tools: ToolRegistry, replies: Vec<String>) -> Agent<ScriptedProvider> {
    Agent::new(ScriptedProvider::new(replies), Arc::new(tools))
}

fn search_registry(calls: Arc<AtomicUsize>, fail: bool) -> ToolRegistry {
    ToolRegistry::new()
        .with(
            ToolSpec::new("search", "Search the web")
                .param(ParamSpec::required("query", ParamType::String, "what to look for"))
                .with_output(ParamType::String),
            tool_fn(move |args| {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(!fail, "search backend offline");
                Ok(json!(format!("results for {}", args["query"])))
            }),
        )
        .unwrap()
}

/// Text of the last user message in the prompt sent for `step` (1-based)
fn feedback_seen_at(result_transcript: &Transcript, step: usize) -> String {
    let prompt = &result_transcript.steps()[step - 1].prompt;
    prompt
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_compute_and_report() {
    let agent = agent(ToolRegistry::new(), vec![code("result = 2+3\nfinal_answer(result)")]);
    let result = agent.run("compute 2+3 and report", 5, STEP_TIMEOUT).await;

    assert!(result.is_success());
    assert_eq!(result.value(), Some(&json!(5)));
    assert_eq!(result.transcript.len(), 1);
    assert!(result.transcript.last().unwrap().is_final());
}

#[tokio::test]
async fn test_missing_code_block_is_fed_back() {
    let agent = agent(
        ToolRegistry::new(),
        vec![
            "I think the answer is 4.".to_string(),
            code("final_answer(4)"),
        ],
    );
    let result = agent.run("what is 2+2?", 5, STEP_TIMEOUT).await;

    assert_eq!(result.value(), Some(&json!(4)));
    let first = &result.transcript.steps()[0];
    assert_eq!(first.error().unwrap().kind, ErrorKind::NoCodeProduced);
    assert!(first.code.is_none());

    let seen = feedback_seen_at(&result.transcript, 2);
    assert_eq!(seen, first.feedback(DEFAULT_MAX_OBSERVATION_CHARS));
    assert!(seen.contains("NoCodeProducedError"));
}

#[tokio::test]
async fn test_tool_failure_is_reported_verbatim() {
    let calls = Arc::new(AtomicUsize::new(0));
    let agent = agent(
        search_registry(Arc::clone(&calls), true),
        vec![
            code("r = search(query=\"rust\")\nprint(r)"),
            code("final_answer('gave up on search')"),
        ],
    );
    let result = agent.run("find rust news", 5, STEP_TIMEOUT).await;

    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let err = result.transcript.steps()[0].error().unwrap();
    assert_eq!(err.kind, ErrorKind::ToolExecution);
    assert_eq!(err.message, "search backend offline");
    assert!(feedback_seen_at(&result.transcript, 2).contains("search backend offline"));
}

#[tokio::test]
async fn test_missing_argument_never_reaches_tool() {
    let calls = Arc::new(AtomicUsize::new(0));
    let agent = agent(
        search_registry(Arc::clone(&calls), false),
        vec![
            code("r = search()"),
            code("r = search(query='ok')\nfinal_answer(r)"),
        ],
    );
    let result = agent.run("search twice", 5, STEP_TIMEOUT).await;

    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let err = result.transcript.steps()[0].error().unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(err.message.contains("missing required argument 'query'"));
}

#[tokio::test]
async fn test_step_budget_exhausted() {
    let provider = ScriptedProvider::new([code("print('still thinking')")]).repeat_last();
    let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));
    let result = agent.run("never finishes", 3, STEP_TIMEOUT).await;

    match &result.status {
        RunStatus::Failed { reason } => {
            assert_eq!(reason.kind(), ErrorKind::StepBudgetExceeded)
        }
        RunStatus::Success { .. } => panic!("run should not succeed"),
    }
    assert_eq!(result.transcript.len(), 3);
    assert!(result.transcript.steps().iter().all(|s| s.error().is_none()));
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let script = vec![
        code("nums = [3, 1, 2]\nnums.sort()\nprint(nums)"),
        "no code here".to_string(),
        code("final_answer(sum(nums))"),
    ];
    let first = agent(ToolRegistry::new(), script.clone())
        .run("sort and sum", 5, STEP_TIMEOUT)
        .await;
    let second = agent(ToolRegistry::new(), script)
        .run("sort and sum", 5, STEP_TIMEOUT)
        .await;

    assert_eq!(first.value(), Some(&json!(6)));
    assert!(first.transcript.same_content(&second.transcript));
}

#[tokio::test]
async fn test_replay_from_json_script() {
    let script = json!([
        {"unavailable": "connection reset"},
        code("final_answer('after retry')"),
    ])
    .to_string();
    let provider = ScriptedProvider::from_json(&script).unwrap();
    let config = AgentConfig::default().with_retry(
        nea_agent::RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
    );
    let agent = Agent::new(provider, Arc::new(ToolRegistry::new())).with_config(config);
    let result = agent.run_task("replay").await;

    assert_eq!(result.value(), Some(&json!("after retry")));
    assert_eq!(agent.gateway().provider().calls(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let provider = ScriptedProvider::new([ScriptedReply::Text(code("x = 7\nfinal_answer(x)"))])
        .repeat_last();
    let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

    let (a, b) = tokio::join!(
        agent.run("first", 2, STEP_TIMEOUT),
        agent.run("second", 2, STEP_TIMEOUT)
    );
    assert_eq!(a.value(), Some(&json!(7)));
    assert_eq!(b.value(), Some(&json!(7)));
    assert_eq!(a.transcript.task().text, "first");
    assert_eq!(b.transcript.task().text, "second");
}

#[tokio::test]
async fn test_transcript_export_round_trip() {
    let agent = agent(
        ToolRegistry::new(),
        vec![code("print('hi')"), code("final_answer('done')")],
    );
    let result = agent.run_task("export me").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transcript.json");
    result.transcript.save(&path).unwrap();
    let loaded = Transcript::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded, result.transcript);
    assert_eq!(result.monitor.step_durations.len(), 2);
}

/// Cancels the run's token as soon as the model has answered
struct CancelAfterReply {
    inner: ScriptedProvider,
    token: CancellationToken,
}

impl LlmProvider for CancelAfterReply {
    fn name(&self) -> &str {
        "cancel-after-reply"
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let response = self.inner.complete(request).await;
        self.token.cancel();
        response
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let receiver = self.inner.stream(request).await;
        self.token.cancel();
        receiver
    }
}

#[tokio::test]
async fn test_cancel_after_reply_skips_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();
    let provider = CancelAfterReply {
        inner: ScriptedProvider::new([code("r = search(query='side effect')\nfinal_answer(r)")]),
        token: token.clone(),
    };
    let agent = Agent::new(provider, Arc::new(search_registry(Arc::clone(&calls), false)));
    let result = agent.run_cancellable("cancel mid-step", token).await;

    let reason = result.reason().unwrap();
    assert_eq!(reason.kind(), ErrorKind::Cancelled);
    assert_eq!(reason.context_value("state"), Some("executing"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(result.transcript.is_empty());
}

#[tokio::test]
async fn test_only_first_code_block_runs() {
    let reply = "Thought: two blocks.\nCode:\n```py\nx = 1\n```\nand\n```py\nx = 99\n```<end_code>";
    let agent = agent(
        ToolRegistry::new(),
        vec![reply.to_string(), code("final_answer(x)")],
    );
    let result = agent.run("first block wins", 5, STEP_TIMEOUT).await;

    assert_eq!(result.value(), Some(&json!(1)));
    let first = &result.transcript.steps()[0];
    assert_eq!(first.code.as_deref(), Some("x = 1"));
    assert_eq!(first.ignored_blocks, vec!["x = 99".to_string()]);
    assert!(feedback_seen_at(&result.transcript, 2).contains("1 further block(s) were ignored"));
}

#[tokio::test]
async fn test_reserved_attachment_names_are_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let tools = Arc::new(search_registry(Arc::clone(&calls), false));
    for name in ["final_answer", "search", "print"] {
        let agent = Agent::new(ScriptedProvider::new([code("final_answer(1)")]), Arc::clone(&tools));
        let task = Task::new("shadow a binding").with_attachment(name, json!("spoofed"));
        let result = agent.run_task(task).await;

        let reason = result.reason().unwrap();
        assert_eq!(reason.kind(), ErrorKind::InvalidTask, "attachment {}", name);
        assert_eq!(reason.context_value("attachment"), Some(name));
        assert_eq!(agent.gateway().provider().calls(), 0);
    }
}

#[tokio::test]
async fn test_undecodable_reply_is_shown_to_model() {
    let agent = Agent::new(
        ScriptedProvider::new(vec![
            ScriptedReply::Malformed("Thought: {\"half\": ".into()),
            ScriptedReply::Text(code("final_answer('fixed')")),
        ]),
        Arc::new(ToolRegistry::new()),
    );
    let result = agent.run("recover from bad output", 5, STEP_TIMEOUT).await;

    assert_eq!(result.value(), Some(&json!("fixed")));
    let prompt = &result.transcript.steps()[1].prompt;
    let echoed = prompt
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.text().to_string())
        .unwrap_or_default();
    assert_eq!(echoed, "Thought: {\"half\":");
    assert!(feedback_seen_at(&result.transcript, 2).contains("ModelProtocolError"));
}
