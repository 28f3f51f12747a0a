//! Per-run bookkeeping and step observers

use nea_vm::{Step, Usage, UsageTracker};
use serde::Serialize;
use std::time::Duration;

/// Called after every step is appended to the transcript
pub trait StepObserver: Send + Sync {
    fn on_step(&self, step: &Step);
}

impl<F> StepObserver for F
where
    F: Fn(&Step) + Send + Sync,
{
    fn on_step(&self, step: &Step) {
        self(step)
    }
}

/// Step timings and token counts for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMonitor {
    pub step_durations: Vec<Duration>,
    pub usage: UsageTracker,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completion(&mut self, model: &str, usage: &Usage) {
        self.usage.track(model, usage);
    }

    pub(crate) fn record_step(&mut self, step: &Step) {
        self.step_durations.push(step.duration);
    }

    pub fn total_duration(&self) -> Duration {
        self.step_durations.iter().sum()
    }

    pub fn input_tokens(&self) -> usize {
        self.usage.total_prompt_tokens
    }

    pub fn output_tokens(&self) -> usize {
        self.usage.total_completion_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nea_vm::{ExecutionOutcome, StepOutcome};

    fn step(ms: u64) -> Step {
        Step {
            index: 1,
            prompt: Vec::new(),
            model_output: None,
            code: None,
            ignored_blocks: Vec::new(),
            outcome: StepOutcome::Executed(ExecutionOutcome::default()),
            usage: None,
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_monitor_totals() {
        let mut monitor = RunMonitor::new();
        monitor.record_step(&step(10));
        monitor.record_step(&step(15));
        monitor.record_completion("m", &Usage::new(100, 20));
        monitor.record_completion("m", &Usage::new(50, 5));

        assert_eq!(monitor.total_duration(), Duration::from_millis(25));
        assert_eq!(monitor.input_tokens(), 150);
        assert_eq!(monitor.output_tokens(), 25);
        assert_eq!(monitor.usage.total_calls, 2);
    }
}
