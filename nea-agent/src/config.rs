//! Agent configuration

use nea_vm::{GatewayConfig, RenderOptions, SandboxLimits, SystemPrompt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of steps before a run gives up
pub const DEFAULT_MAX_STEPS: usize = 6;

/// Default wall-clock budget for one code execution
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff for transient model failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first transient error
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(10);
        let factor = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Steps allowed before the run fails
    pub max_steps: usize,
    /// Budget for executing one step's code
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
    /// Memory window used when rendering the transcript
    pub render: RenderOptions,
    pub limits: SandboxLimits,
    /// Model, stop sequences and streaming
    pub gateway: GatewayConfig,
    pub system_prompt: SystemPrompt,
    /// Survey facts and write a plan before step 1 and every N steps after
    pub planning_interval: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            retry: RetryPolicy::default(),
            render: RenderOptions::default(),
            limits: SandboxLimits::default(),
            gateway: GatewayConfig::default(),
            system_prompt: SystemPrompt::default(),
            planning_interval: None,
        }
    }
}

impl AgentConfig {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_system_prompt(mut self, prompt: SystemPrompt) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_planning_interval(mut self, every: usize) -> Self {
        self.planning_interval = Some(every);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(150));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(600));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        let policy = RetryPolicy::default().with_backoff(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(10));
    }

    #[test]
    fn test_config_builders() {
        let config = AgentConfig::default()
            .with_max_steps(3)
            .with_step_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::none());
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.gateway.stop.len(), 2);
        assert_eq!(config.planning_interval, None);
        assert_eq!(config.with_planning_interval(3).planning_interval, Some(3));
    }
}
