//! # nea CLI
//!
//! Command-line interface for running the nea agent.
//!
//! Usage:
//!   nea <task>
//!   nea run [OPTIONS] <task>
//!   nea replay <script.json> [task]
//!   nea tools
//!
//! Examples:
//!   nea "What is the 20th Fibonacci number?"
//!   nea run --provider anthropic --max-steps 8 "Summarize the numbers 1..10"
//!   nea run --arg 'items=[3,1,2]' "Sort items and report the median"
//!   nea replay demos/fibonacci.json "Compute fib(10)" --transcript out.json

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use nea_agent::{Agent, AgentConfig, RunResult, RunStatus, DEFAULT_MAX_STEPS};
use nea_vm::default_tools::register_interactive;
use nea_vm::{
    AnthropicProvider, GatewayConfig, LlmProvider, OpenAIProvider, ProviderConfig, ProviderType,
    ScriptedProvider, Task, ToolRegistry,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOCAL_URL: &str = "http://localhost:11434/v1";
const DEFAULT_LOCAL_MODEL: &str = "llama3.1";

#[derive(Parser)]
#[command(name = "nea")]
#[command(author, version, about = "nea - an agent that thinks in code")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Task to execute (when not using subcommands)
    #[arg(trailing_var_arg = true)]
    task: Vec<String>,

    /// Model backend: openai, anthropic, local
    #[arg(long, global = true, default_value = "openai")]
    provider: ProviderType,

    /// Model name (defaults to the provider's)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Override the provider endpoint
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Steps before the run gives up
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_STEPS)]
    max_steps: usize,

    /// Seconds allowed for each code execution
    #[arg(long, global = true, default_value_t = 30)]
    step_timeout: u64,

    /// Survey facts and re-plan every N steps
    #[arg(long, global = true, value_name = "N")]
    planning_interval: Option<usize>,

    /// Variable made available to the agent's code, as NAME=JSON
    #[arg(long = "arg", global = true, value_name = "NAME=JSON")]
    args: Vec<String>,

    /// Write the run transcript as JSON
    #[arg(long, global = true)]
    transcript: Option<PathBuf>,

    /// Stream model output
    #[arg(long, global = true)]
    stream: bool,

    /// Do not offer the `user_input` tool
    #[arg(long, global = true)]
    no_input: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show the final answer
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task against a live model
    Run {
        /// The task description
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Run a task against scripted model replies from a JSON file
    Replay {
        /// JSON array of replies
        #[arg(required = true)]
        file: PathBuf,

        /// The task description
        #[arg(trailing_var_arg = true)]
        task: Vec<String>,
    },
    /// List the tools the agent can call
    Tools,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn build_registry(interactive: bool) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    if interactive {
        register_interactive(&mut registry)?;
    }
    Ok(registry)
}

/// Parse `NAME=JSON` pairs; values that are not JSON are taken as strings
fn parse_attachments(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut attachments = Map::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            bail!("invalid --arg '{}': expected NAME=JSON", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        attachments.insert(name.trim().to_string(), value);
    }
    Ok(attachments)
}

fn api_key(var: &str) -> anyhow::Result<String> {
    std::env::var(var).with_context(|| format!("{} is not set", var))
}

fn provider_config(cli: &Cli) -> anyhow::Result<ProviderConfig> {
    let mut config = match cli.provider {
        ProviderType::OpenAI => ProviderConfig::openai(api_key("OPENAI_API_KEY")?),
        ProviderType::Anthropic => ProviderConfig::anthropic(api_key("ANTHROPIC_API_KEY")?),
        ProviderType::Local => ProviderConfig::local(
            cli.base_url.as_deref().unwrap_or(DEFAULT_LOCAL_URL),
            cli.model.as_deref().unwrap_or(DEFAULT_LOCAL_MODEL),
        ),
        ProviderType::Scripted => bail!("the scripted provider is only available through `nea replay`"),
    };
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    if let Some(url) = &cli.base_url {
        config = config.with_base_url(url.clone());
    }
    Ok(config)
}

fn agent_config(cli: &Cli) -> AgentConfig {
    let config = AgentConfig::default()
        .with_max_steps(cli.max_steps)
        .with_step_timeout(Duration::from_secs(cli.step_timeout))
        .with_gateway(GatewayConfig::default().with_streaming(cli.stream));
    match cli.planning_interval {
        Some(every) => config.with_planning_interval(every),
        None => config,
    }
}

async fn execute<P: LlmProvider>(provider: P, cli: &Cli, task: Task) -> anyhow::Result<ExitCode> {
    let tools = Arc::new(build_registry(!cli.no_input)?);
    let agent = Agent::new(provider, tools).with_config(agent_config(cli));
    let result = agent
        .run(task, cli.max_steps, Duration::from_secs(cli.step_timeout))
        .await;

    if let Some(path) = &cli.transcript {
        result.transcript.save(path)?;
        if !cli.quiet {
            eprintln!("Transcript written to {}", path.display());
        }
    }
    Ok(report(&result, cli.quiet))
}

fn report(result: &RunResult, quiet: bool) -> ExitCode {
    if !quiet {
        eprintln!(
            "\n--- {} step(s), {:.1}s, {} input / {} output tokens ---\n",
            result.transcript.len(),
            result.monitor.total_duration().as_secs_f64(),
            result.monitor.input_tokens(),
            result.monitor.output_tokens()
        );
    }
    match &result.status {
        RunStatus::Success { value } => {
            match value {
                Value::String(s) => println!("{}", s),
                other => println!(
                    "{}",
                    serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
                ),
            }
            ExitCode::SUCCESS
        }
        RunStatus::Failed { reason } => {
            eprintln!("Run failed: {}", reason.brief());
            ExitCode::FAILURE
        }
    }
}

fn list_tools(cli: &Cli) -> anyhow::Result<()> {
    let registry = build_registry(!cli.no_input)?;
    println!("{}", registry.describe());
    Ok(())
}

fn read_script(file: &Path) -> anyhow::Result<ScriptedProvider> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let provider = ScriptedProvider::from_json(&json)
        .with_context(|| format!("invalid replay script {}", file.display()))?;
    Ok(provider)
}

fn make_task(words: &[String], cli: &Cli) -> anyhow::Result<Task> {
    Ok(Task::new(words.join(" ")).with_attachments(parse_attachments(&cli.args)?))
}

async fn run_live(words: &[String], cli: &Cli) -> anyhow::Result<ExitCode> {
    let task = make_task(words, cli)?;
    let config = provider_config(cli)?;
    match cli.provider {
        ProviderType::Anthropic => execute(AnthropicProvider::new(config)?, cli, task).await,
        _ => execute(OpenAIProvider::new(config)?, cli, task).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match &cli.command {
        Some(Commands::Tools) => {
            list_tools(&cli)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Replay { file, task }) => {
            let provider = read_script(file)?;
            let words = if task.is_empty() {
                vec![format!("Replay {}", file.display())]
            } else {
                task.clone()
            };
            execute(provider, &cli, make_task(&words, &cli)?).await
        }
        Some(Commands::Run { task }) => run_live(task, &cli).await,
        None => {
            if cli.task.is_empty() {
                eprintln!("Error: No task provided.");
                eprintln!("Usage: nea [OPTIONS] <TASK>...");
                eprintln!("       nea run <TASK>...");
                eprintln!("       nea replay <FILE.json> [TASK]...");
                eprintln!("       nea tools");
                eprintln!("\nExamples:");
                eprintln!("  nea \"What is the 20th Fibonacci number?\"");
                eprintln!("  nea --provider local --model qwen2.5-coder \"Sum 1..100\"");
                eprintln!("  nea --help");
                return Ok(ExitCode::FAILURE);
            }
            run_live(&cli.task, &cli).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_attachments() {
        let args = vec![
            "items=[1, 2, 3]".to_string(),
            "name=alice".to_string(),
            "limit=5".to_string(),
        ];
        let map = parse_attachments(&args).unwrap();
        assert_eq!(map["items"], json!([1, 2, 3]));
        assert_eq!(map["name"], json!("alice"));
        assert_eq!(map["limit"], json!(5));

        assert!(parse_attachments(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["nea", "run", "add", "two", "numbers"]);
        assert_eq!(cli.provider, ProviderType::OpenAI);
        assert_eq!(cli.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(agent_config(&cli).planning_interval, None);
        match cli.command {
            Some(Commands::Run { task }) => assert_eq!(task.join(" "), "add two numbers"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_planning_interval_flag() {
        let cli = Cli::parse_from(["nea", "--planning-interval", "3", "plan ahead"]);
        assert_eq!(agent_config(&cli).planning_interval, Some(3));
    }

    #[test]
    fn test_scripted_provider_needs_replay() {
        let cli = Cli::parse_from(["nea", "--provider", "scripted", "task"]);
        assert!(provider_config(&cli).is_err());
    }

    #[tokio::test]
    async fn test_replay_script_runs_offline() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.json");
        std::fs::write(
            &script,
            json!(["Code:\n```py\nfinal_answer(sum(items))\n```<end_code>"]).to_string(),
        )
        .unwrap();
        let out = dir.path().join("transcript.json");

        let cli = Cli::parse_from([
            "nea".to_string(),
            "replay".to_string(),
            script.display().to_string(),
            "--arg".to_string(),
            "items=[1,2,3]".to_string(),
            "--transcript".to_string(),
            out.display().to_string(),
            "--no-input".to_string(),
            "-q".to_string(),
        ]);
        let provider = read_script(&script).unwrap();
        let task = make_task(&["sum items".to_string()], &cli).unwrap();
        let code = execute(provider, &cli, task).await.unwrap();

        assert_eq!(code, ExitCode::SUCCESS);
        assert!(out.exists());
    }
}
