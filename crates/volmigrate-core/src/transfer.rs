//! The transfer protocol run inside the rsync workload
//!
//! `volmigrate rsync ...` is the container command of every rsync Job. It
//! invokes `rsync` up to `max_attempts` times with a fixed delay between
//! attempts and exits non-zero once the budget is spent. This is the only
//! retry boundary for the copy itself: the engine never reruns a strategy.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Mount path of the source claim inside transfer workloads
pub const SOURCE_MOUNT: &str = "/source";

/// Mount path of the destination claim inside transfer workloads
pub const DEST_MOUNT: &str = "/dest";

/// Bounded retry parameters of the transfer protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of rsync invocations
    pub max_attempts: u32,
    /// Fixed delay between a failed invocation and the next one
    pub delay: Duration,
    /// ssh connection establishment timeout
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// sshd endpoint to pull from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// Address of the sshd service
    pub host: String,
    /// Port of the sshd service
    pub port: u16,
    /// ssh `ConnectTimeout`
    pub connect_timeout: Duration,
}

/// Everything one transfer needs, fixed at workload construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSpec {
    /// Source directory (remote path when `remote` is set)
    pub source: String,
    /// Destination directory
    pub dest: String,
    /// Delete destination files missing from the source
    pub delete_extraneous: bool,
    /// Keep owner and group
    pub preserve_ownership: bool,
    /// Pull over ssh from this endpoint instead of copying locally
    pub remote: Option<RemoteEndpoint>,
    /// Retry budget
    pub policy: RetryPolicy,
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

impl TransferSpec {
    /// Arguments for one `rsync` invocation
    pub fn rsync_args(&self) -> Vec<String> {
        let mut args = vec!["-avzh".to_string(), "--progress".to_string()];
        if self.delete_extraneous {
            args.push("--delete".to_string());
        }
        if !self.preserve_ownership {
            args.push("--no-o".to_string());
            args.push("--no-g".to_string());
        }

        let source = with_trailing_slash(&self.source);
        match &self.remote {
            Some(remote) => {
                args.push("-e".to_string());
                args.push(format!(
                    "ssh -p {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o ConnectTimeout={}",
                    remote.port,
                    remote.connect_timeout.as_secs()
                ));
                args.push(format!("root@{}:{}", remote.host, source));
            }
            None => args.push(source),
        }
        args.push(with_trailing_slash(&self.dest));
        args
    }

    /// Arguments of the `volmigrate rsync` subcommand that reproduces this spec
    pub fn workload_args(&self) -> Vec<String> {
        let mut args = vec![
            "rsync".to_string(),
            "--source".to_string(),
            self.source.clone(),
            "--dest".to_string(),
            self.dest.clone(),
            "--max-attempts".to_string(),
            self.policy.max_attempts.to_string(),
            "--retry-delay-secs".to_string(),
            self.policy.delay.as_secs().to_string(),
        ];
        if self.delete_extraneous {
            args.push("--delete".to_string());
        }
        if !self.preserve_ownership {
            args.push("--no-chown".to_string());
        }
        if let Some(remote) = &self.remote {
            args.extend([
                "--ssh-host".to_string(),
                remote.host.clone(),
                "--ssh-port".to_string(),
                remote.port.to_string(),
                "--connect-timeout-secs".to_string(),
                remote.connect_timeout.as_secs().to_string(),
            ]);
        }
        args
    }
}

/// The external copy tool. Only the exit code matters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferTool: Send + Sync {
    /// Run the tool once and return its exit code
    async fn invoke(&self, args: &[String]) -> std::io::Result<i32>;
}

/// `rsync` from `PATH`, output passed through to the container log
#[derive(Clone, Debug, Default)]
pub struct Rsync;

#[async_trait]
impl TransferTool for Rsync {
    async fn invoke(&self, args: &[String]) -> std::io::Result<i32> {
        let status = Command::new("rsync").args(args).status().await?;
        // killed by a signal
        Ok(status.code().unwrap_or(-1))
    }
}

/// Run the protocol. Returns the number of attempts it took to succeed.
///
/// A tool that cannot be spawned counts as a failed attempt. After the last
/// failed attempt no delay is taken.
pub async fn run(tool: &dyn TransferTool, spec: &TransferSpec) -> Result<u32> {
    let max_attempts = spec.policy.max_attempts.max(1);
    let args = spec.rsync_args();

    for attempt in 1..=max_attempts {
        match tool.invoke(&args).await {
            Ok(0) => {
                info!(attempt, "rsync completed");
                return Ok(attempt);
            }
            Ok(code) => warn!(attempt, max_attempts, exit_code = code, "rsync attempt failed"),
            Err(e) => warn!(attempt, max_attempts, error = %e, "rsync could not be started"),
        }

        if attempt < max_attempts {
            info!(
                delay_secs = spec.policy.delay.as_secs(),
                "waiting before next rsync attempt"
            );
            tokio::time::sleep(spec.policy.delay).await;
        }
    }

    error!(attempts = max_attempts, "rsync failed, retries exhausted");
    Err(Error::TransferExhausted {
        attempts: max_attempts,
    })
}
