//! # device-volume-driver
//! Watches the Docker engine and grants every running container access to the
//! host device nodes bind-mounted into it, through the container's device cgroup.
mod daemon;
mod docker;
mod observability;
mod reload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{crate_version, Parser};
use libdevcgroups::config::{
    Config, DEFAULT_DEVICE_PREFIX, DEFAULT_HOST_ROOT, DEFAULT_PLUGIN_ID, DEFAULT_PROC_ROOT,
};
use libdevcgroups::reconcile::Reconciler;

use crate::daemon::Daemon;
use crate::docker::DockerClient;

#[derive(Parser, Debug)]
#[clap(version = crate_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// Where the host root filesystem is mounted
    #[clap(long, default_value = DEFAULT_HOST_ROOT)]
    host_root: PathBuf,
    /// Proc filesystem showing host processes
    #[clap(long, default_value = DEFAULT_PROC_ROOT)]
    proc_root: PathBuf,
    /// Mounts with a host source below this path are granted as devices
    #[clap(long, default_value = DEFAULT_DEVICE_PREFIX)]
    device_prefix: PathBuf,
    /// Docker engine address, only unix:// is supported
    #[clap(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,
    /// Syslog identifier of journald entries
    #[clap(long, default_value = DEFAULT_PLUGIN_ID)]
    plugin_id: String,
    /// Enable debug logging
    #[clap(long)]
    debug: bool,
    /// Log level, takes precedence over --debug
    #[clap(long)]
    log_level: Option<String>,
    /// Write logs to this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,
    /// Log format: text or json
    #[clap(long)]
    log_format: Option<String>,
    /// Also log to journald
    #[clap(long)]
    systemd_log: bool,
}

impl From<&Opts> for Config {
    fn from(opts: &Opts) -> Self {
        Self {
            host_root: opts.host_root.clone(),
            proc_root: opts.proc_root.clone(),
            device_prefix: opts.device_prefix.clone(),
            plugin_id: opts.plugin_id.clone(),
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {:?}", e);
    }

    let config = Arc::new(Config::from(&opts));
    let socket = docker::socket_path(opts.docker_host.as_deref())?;
    tracing::info!(
        version = crate_version!(),
        host_root = %config.host_root.display(),
        docker = %socket.display(),
        "starting device volume driver"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let daemon = Daemon::new(DockerClient::new(socket), Reconciler::new(config));
    let result = runtime.block_on(daemon.run());
    if let Err(err) = &result {
        tracing::error!("{:#}", err);
    }
    result
}
