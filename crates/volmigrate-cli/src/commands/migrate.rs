//! `volmigrate migrate`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::info;
use volmigrate_core::{ClusterClient, MigrationRequest, Options, VolumeRef};

use super::{connect, ClusterConnection};
use crate::config::{self, FileConfig};
use crate::{Error, Result};

/// Copy the contents of one PersistentVolumeClaim into another
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Source PersistentVolumeClaim
    pub source: String,

    /// Destination PersistentVolumeClaim
    pub dest: String,

    /// Kubeconfig of the source cluster
    #[arg(short = 'k', long, env = "VOLMIGRATE_SOURCE_KUBECONFIG")]
    pub source_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context of the source cluster
    #[arg(short = 'c', long, env = "VOLMIGRATE_SOURCE_CONTEXT")]
    pub source_context: Option<String>,

    /// Namespace of the source claim (default: the context's namespace)
    #[arg(short = 'n', long, env = "VOLMIGRATE_SOURCE_NAMESPACE")]
    pub source_namespace: Option<String>,

    /// Kubeconfig of the destination cluster (default: the source's)
    #[arg(short = 'K', long, env = "VOLMIGRATE_DEST_KUBECONFIG")]
    pub dest_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context of the destination cluster (default: the source's)
    #[arg(short = 'C', long, env = "VOLMIGRATE_DEST_CONTEXT")]
    pub dest_context: Option<String>,

    /// Namespace of the destination claim (default: the context's namespace)
    #[arg(short = 'N', long, env = "VOLMIGRATE_DEST_NAMESPACE")]
    pub dest_namespace: Option<String>,

    /// Delete destination files that do not exist in the source
    #[arg(
        short = 'd',
        long = "dest-delete-extraneous-files",
        env = "VOLMIGRATE_DEST_DELETE_EXTRANEOUS_FILES"
    )]
    pub delete_extraneous: bool,

    /// Migrate even if a claim is mounted by a running pod
    #[arg(short = 'i', long, env = "VOLMIGRATE_IGNORE_MOUNTED")]
    pub ignore_mounted: bool,

    /// Do not preserve file owner and group
    #[arg(short = 'o', long, env = "VOLMIGRATE_NO_CHOWN")]
    pub no_chown: bool,

    /// Strategies to try, in order (mnt2, svc, nodeport, lbsvc)
    #[arg(
        short = 's',
        long,
        value_delimiter = ',',
        env = "VOLMIGRATE_STRATEGIES"
    )]
    pub strategies: Option<Vec<String>>,

    /// Image of the rsync job
    #[arg(short = 'r', long, env = "VOLMIGRATE_RSYNC_IMAGE")]
    pub rsync_image: Option<String>,

    /// Image of the sshd pod
    #[arg(short = 'S', long, env = "VOLMIGRATE_SSHD_IMAGE")]
    pub sshd_image: Option<String>,

    /// ssh key algorithm (ed25519 or rsa)
    #[arg(short = 'a', long, env = "VOLMIGRATE_SSH_KEY_ALGORITHM")]
    pub ssh_key_algorithm: Option<String>,

    /// Create the shared PodSecurityPolicy in the source cluster
    #[arg(long, env = "VOLMIGRATE_SOURCE_CREATE_PSP")]
    pub source_create_psp: bool,

    /// Create the shared PodSecurityPolicy in the destination cluster
    #[arg(long, env = "VOLMIGRATE_DEST_CREATE_PSP")]
    pub dest_create_psp: bool,
}

impl MigrateArgs {
    /// Engine options: flags and environment over `file` over defaults
    pub fn build_options(&self, file: &FileConfig) -> Options {
        let mut options = Options::default();
        file.apply(&mut options);

        options.delete_extraneous = self.delete_extraneous;
        options.ignore_mounted = self.ignore_mounted;
        options.preserve_ownership = !self.no_chown;
        options.source_create_psp = self.source_create_psp;
        options.dest_create_psp = self.dest_create_psp;

        if let Some(strategies) = &self.strategies {
            options.strategies = Some(strategies.clone());
        }
        if let Some(image) = &self.rsync_image {
            options.rsync_image = image.clone();
        }
        if let Some(image) = &self.sshd_image {
            options.sshd_image = image.clone();
        }
        if let Some(algorithm) = &self.ssh_key_algorithm {
            options.key_algorithm = algorithm.clone();
        }
        options
    }

    /// Reject values clap accepts but the engine cannot use
    pub fn validate(&self) -> Result<()> {
        if let Some(strategies) = &self.strategies {
            if strategies.is_empty() || strategies.iter().any(|s| s.trim().is_empty()) {
                return Err(Error::validation(
                    "--strategies must be a comma-separated list of strategy names",
                ));
            }
        }
        for (flag, namespace) in [
            ("--source-namespace", &self.source_namespace),
            ("--dest-namespace", &self.dest_namespace),
        ] {
            if namespace.as_deref().is_some_and(|ns| ns.trim().is_empty()) {
                return Err(Error::validation(format!("{flag} must not be empty")));
            }
        }
        Ok(())
    }

    fn dest_uses_source_cluster(&self) -> bool {
        self.dest_kubeconfig.is_none() && self.dest_context.is_none()
    }
}

fn volume_ref(connection: &ClusterConnection, namespace: Option<&str>, name: &str) -> VolumeRef {
    let client: Arc<dyn ClusterClient> = Arc::new(connection.client.clone());
    VolumeRef::new(
        client,
        namespace.unwrap_or(&connection.default_namespace),
        name,
    )
}

pub async fn run(args: MigrateArgs, config_path: Option<&Path>) -> Result<()> {
    args.validate()?;
    let file = config::load(config_path)?;
    let options = args.build_options(&file);

    let source_conn = connect(
        args.source_kubeconfig.as_deref(),
        args.source_context.as_deref(),
    )
    .await?;
    let dest_conn = if args.dest_uses_source_cluster() {
        None
    } else {
        let kubeconfig = args
            .dest_kubeconfig
            .as_deref()
            .or(args.source_kubeconfig.as_deref());
        Some(connect(kubeconfig, args.dest_context.as_deref()).await?)
    };

    let source = volume_ref(&source_conn, args.source_namespace.as_deref(), &args.source);
    let dest = volume_ref(
        dest_conn.as_ref().unwrap_or(&source_conn),
        args.dest_namespace.as_deref(),
        &args.dest,
    );

    let request = MigrationRequest {
        source,
        dest,
        options,
    };
    let strategy = volmigrate_core::run(&request).await?;

    info!(
        source = %request.source,
        dest = %request.dest,
        strategy = %strategy,
        "migration complete"
    );
    println!(
        "Migrated {} to {} using strategy {}",
        request.source, request.dest, strategy
    );
    Ok(())
}
