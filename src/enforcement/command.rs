//! External OS command execution.
//!
//! Every firewall, routing, shaping and neighbor-table call goes through a
//! `CommandRunner`, so backends can be driven by a scripted runner in tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

/// Host operating system family, used to pick mechanisms and parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, killing it after `timeout`.
    ///
    /// A missing binary or a timeout is `MechanismUnavailable`; a non-zero exit
    /// is reported through `CommandOutput::success`.
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> CoreResult<CommandOutput>;

    /// Like `run`, but a non-zero exit becomes `MechanismUnavailable` carrying stderr.
    async fn run_checked(&self, program: &str, args: &[&str], timeout: Duration) -> CoreResult<String> {
        let output = self.run(program, args, timeout).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Err(CoreError::MechanismUnavailable(format!(
                "{program} {} failed: {detail}",
                args.first().copied().unwrap_or_default()
            )))
        }
    }
}

/// Runs real processes through `tokio::process`.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> CoreResult<CommandOutput> {
        tracing::debug!("exec: {program} {}", args.join(" "));
        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::MechanismUnavailable(format!("{program} is not installed")))
            }
            Ok(Err(e)) => return Err(CoreError::Io(format!("{program}: {e}"))),
            Err(_) => {
                return Err(CoreError::MechanismUnavailable(format!(
                    "{program} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[tokio::test]
    async fn test_run_checked_maps_failure_to_mechanism_unavailable() {
        let runner = ScriptedRunner::new().fail_on("tc qdisc");
        let err = runner
            .run_checked("tc", &["qdisc", "add", "dev", "eth0"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
        assert!(err.to_string().contains("operation not permitted"));
    }

    #[tokio::test]
    async fn test_scripted_runner_records_calls_and_responses() {
        let runner = ScriptedRunner::new().respond("ip route show default", "default via 10.0.0.1 dev wlan0");
        let out = runner
            .run_checked("ip", &["route", "show", "default"], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.contains("wlan0"));
        assert_eq!(runner.calls(), vec!["ip route show default".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_mechanism_unavailable() {
        let err = SystemCommandRunner
            .run("lanward-no-such-binary", &[], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
    }

    #[test]
    fn test_platform_matches_target() {
        let p = Platform::current();
        if cfg!(target_os = "linux") {
            assert_eq!(p, Platform::Linux);
        } else if cfg!(windows) {
            assert_eq!(p, Platform::Windows);
        }
    }
}
