//! `volmigrate rsync`: the transfer protocol inside the rsync job

use std::time::Duration;

use clap::Args;
use volmigrate_core::transfer::{self, RemoteEndpoint, RetryPolicy, Rsync, TransferSpec};

use crate::Result;

/// Copy with bounded retries
#[derive(Args, Debug)]
pub struct RsyncArgs {
    /// Source directory (path on the remote host with --ssh-host)
    #[arg(long)]
    pub source: String,

    /// Destination directory
    #[arg(long)]
    pub dest: String,

    /// Delete destination files missing from the source
    #[arg(long)]
    pub delete: bool,

    /// Do not preserve owner and group
    #[arg(long)]
    pub no_chown: bool,

    /// Pull from this sshd host instead of copying locally
    #[arg(long)]
    pub ssh_host: Option<String>,

    /// sshd port
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    /// ssh connection timeout
    #[arg(long, requires = "ssh_host")]
    pub connect_timeout_secs: Option<u64>,

    /// Maximum number of rsync invocations
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between attempts
    #[arg(long)]
    pub retry_delay_secs: Option<u64>,
}

impl RsyncArgs {
    /// The transfer these arguments describe
    pub fn transfer_spec(&self) -> TransferSpec {
        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            delay: self
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
            connect_timeout: self
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        };

        TransferSpec {
            source: self.source.clone(),
            dest: self.dest.clone(),
            delete_extraneous: self.delete,
            preserve_ownership: !self.no_chown,
            remote: self.ssh_host.as_ref().map(|host| RemoteEndpoint {
                host: host.clone(),
                port: self.ssh_port,
                connect_timeout: policy.connect_timeout,
            }),
            policy,
        }
    }
}

pub async fn run(args: RsyncArgs) -> Result<()> {
    transfer::run(&Rsync, &args.transfer_spec()).await?;
    Ok(())
}
