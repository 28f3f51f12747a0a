//! # nea Agent
//!
//! The agent drives one task to completion as a small state machine:
//!
//! ```text
//! Init -> Planning -> Executing -> Evaluating -> { Planning | Done | Failed }
//! ```
//!
//! 1. `Init` validates the task and binds its attachments in a fresh sandbox
//! 2. `Planning` renders the transcript and asks the model for the next turn
//! 3. `Executing` extracts the code block and runs it in the sandbox
//! 4. `Evaluating` records the step, then stops on a final answer or
//!    an exhausted step budget
//!
//! Errors raised inside a step become part of the transcript and the model
//! sees them on its next turn. Only an unreachable model, a cancelled run
//! or an exhausted budget end the run early.
//!
//! With a planning interval set, `Planning` first asks the model for a
//! facts survey and a plan, before step 1 and every N steps after. A
//! [`ManagedAgent`] lets one agent delegate to another through a tool call.

mod agent;
mod config;
mod managed;
mod monitor;

pub use agent::{Agent, RunResult, RunStatus};
pub use config::{AgentConfig, RetryPolicy, DEFAULT_MAX_STEPS, DEFAULT_STEP_TIMEOUT};
pub use managed::ManagedAgent;
pub use monitor::{RunMonitor, StepObserver};
pub use tokio_util::sync::CancellationToken;
