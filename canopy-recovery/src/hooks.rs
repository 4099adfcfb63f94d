//! External failover hooks
//!
//! Pre/post-failover processes configured by the operator: arbitrary shell
//! commands run with a templated environment describing the failure. A
//! failing pre hook aborts the recovery; post hook failures are recorded
//! but not fatal.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use canopy_core::{InstanceKey, Result, TopologyError};

/// Values templated into every hook's environment
#[derive(Debug, Clone)]
pub struct HookContext {
    pub cluster_name: String,
    pub failed_key: InstanceKey,
    pub successor_key: Option<InstanceKey>,
    pub analysis_code: String,
}

/// Runs operator-configured hook commands
#[derive(Debug, Clone)]
pub struct HookRunner {
    /// Per-command deadline
    pub command_timeout: Duration,
}

impl Default for HookRunner {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl HookRunner {
    /// Run pre-failover hooks; the first non-zero exit aborts.
    pub async fn run_pre(&self, commands: &[String], context: &HookContext) -> Result<()> {
        for command in commands {
            let status = self.run_one(command, context).await?;
            if !status.success() {
                return Err(TopologyError::ExternalHookFailed(format!(
                    "pre-failover hook {command:?} exited with {status}"
                )));
            }
            info!(command = %command, "Pre-failover hook succeeded");
        }
        Ok(())
    }

    /// Run post-failover hooks; failures are collected, not fatal.
    pub async fn run_post(
        &self,
        commands: &[String],
        context: &HookContext,
    ) -> Vec<(String, TopologyError)> {
        let mut failures = Vec::new();
        for command in commands {
            match self.run_one(command, context).await {
                Ok(status) if status.success() => {
                    info!(command = %command, "Post-failover hook succeeded");
                }
                Ok(status) => {
                    warn!(command = %command, status = %status, "Post-failover hook failed");
                    failures.push((
                        command.clone(),
                        TopologyError::ExternalHookFailed(format!(
                            "post-failover hook {command:?} exited with {status}"
                        )),
                    ));
                }
                Err(e) => {
                    warn!(command = %command, error = %e, "Post-failover hook failed");
                    failures.push((command.clone(), e));
                }
            }
        }
        failures
    }

    async fn run_one(&self, command: &str, context: &HookContext) -> Result<ExitStatus> {
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .env("CANOPY_CLUSTER", &context.cluster_name)
            .env("CANOPY_ANALYSIS_CODE", &context.analysis_code)
            .env("CANOPY_FAILED_HOST", &context.failed_key.hostname)
            .env("CANOPY_FAILED_PORT", context.failed_key.port.to_string());
        if let Some(successor) = &context.successor_key {
            process
                .env("CANOPY_SUCCESSOR_HOST", &successor.hostname)
                .env("CANOPY_SUCCESSOR_PORT", successor.port.to_string());
        }
        timeout(self.command_timeout, process.status())
            .await
            .map_err(|_| TopologyError::Timeout(format!("hook {command:?}")))?
            .map_err(|e| TopologyError::ExternalHookFailed(format!("hook {command:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HookContext {
        HookContext {
            cluster_name: "main".to_string(),
            failed_key: InstanceKey::new("p", 3306),
            successor_key: Some(InstanceKey::new("a", 3306)),
            analysis_code: "DeadPrimary".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pre_hook_success() {
        let runner = HookRunner::default();
        runner.run_pre(&["true".to_string()], &context()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pre_hook_failure_aborts() {
        let runner = HookRunner::default();
        let result = runner
            .run_pre(&["exit 3".to_string(), "true".to_string()], &context())
            .await;
        assert!(matches!(result, Err(TopologyError::ExternalHookFailed(_))));
    }

    #[tokio::test]
    async fn test_hook_environment_is_templated() {
        let runner = HookRunner::default();
        runner
            .run_pre(
                &[r#"test "$CANOPY_FAILED_HOST:$CANOPY_FAILED_PORT" = "p:3306""#.to_string(),
                  r#"test "$CANOPY_SUCCESSOR_HOST" = "a""#.to_string()],
                &context(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_hook_failures_are_collected() {
        let runner = HookRunner::default();
        let failures = runner
            .run_post(&["false".to_string(), "true".to_string()], &context())
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "false");
    }
}
