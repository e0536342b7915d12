use std::sync::Arc;

use anyhow::{Context, Result};
use libdevcgroups::reconcile::{short_id, ReconcileReport, Reconciler};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::docker::{ContainerDetails, DockerClient, EventStream, RuntimeError};
use crate::reload;

const TRIGGER_CAPACITY: usize = 64;

/// Why a reconciliation has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    ContainerStarted(String),
    Reload { active: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    /// Runtime errors abort the daemon.
    Startup,
    /// Runtime errors are logged.
    Reload,
}

pub struct Daemon {
    docker: Arc<DockerClient>,
    reconciler: Arc<Reconciler>,
}

impl Daemon {
    pub fn new(docker: DockerClient, reconciler: Reconciler) -> Self {
        Self {
            docker: Arc::new(docker),
            reconciler: Arc::new(reconciler),
        }
    }

    /// Runs until SIGINT or SIGTERM, or until the docker event stream fails.
    pub async fn run(self) -> Result<()> {
        // subscribe before the scan so containers started during it are not missed
        let events = self
            .docker
            .events()
            .await
            .with_context(|| {
                format!(
                    "failed to subscribe to events of {}",
                    self.docker.socket_path().display()
                )
            })?;
        self.full_scan(ScanMode::Startup).await?;

        let (trigger_tx, mut trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut events_task = tokio::spawn(forward_events(
            events,
            trigger_tx.clone(),
            shutdown_rx.clone(),
        ));
        let reload_task =
            tokio::task::spawn_blocking(move || reload::run(trigger_tx, shutdown_rx));

        let mut signals = ShutdownSignals::new()?;
        let mut events_done = false;
        let result = loop {
            tokio::select! {
                Some(trigger) = trigger_rx.recv() => self.handle(trigger).await,
                name = signals.recv() => {
                    tracing::info!("received {}, shutting down", name);
                    break Ok(());
                }
                joined = &mut events_task, if !events_done => {
                    events_done = true;
                    break flatten(joined).context("docker event stream failed");
                }
            }
        };

        // listeners blocked on a full queue see the channel close
        drop(trigger_rx);
        let _ = shutdown_tx.send(true);
        if !events_done {
            if let Err(err) = flatten(events_task.await) {
                tracing::debug!("event listener stopped with error: {:#}", err);
            }
        }
        if let Err(err) = reload_task.await {
            tracing::warn!("reload listener panicked: {}", err);
        }

        result
    }

    async fn handle(&self, trigger: Trigger) {
        match trigger {
            Trigger::ContainerStarted(id) => match self.docker.inspect_container(&id).await {
                Ok(details) => self.reconcile(details).await,
                Err(err) => {
                    tracing::warn!(container = short_id(&id), "dropping start event: {}", err)
                }
            },
            Trigger::Reload { active } => {
                tracing::info!(active, "re-scanning containers after systemd reload");
                if let Err(err) = self.full_scan(ScanMode::Reload).await {
                    tracing::warn!("re-scan after reload failed: {:#}", err);
                }
            }
        }
    }

    async fn full_scan(&self, mode: ScanMode) -> Result<()> {
        self.reconciler.prune();

        let containers = self
            .docker
            .list_containers()
            .await
            .context("failed to list containers")?;
        tracing::info!(count = containers.len(), "scanning running containers");

        for container in containers {
            let id = short_id(&container.id);
            tracing::info!(container = id, image = %container.image, "found container");

            match self.docker.inspect_container(&container.id).await {
                Ok(details) => self.reconcile(details).await,
                // the container exited between list and inspect
                Err(RuntimeError::NotFound(_)) => {
                    tracing::info!(container = id, "container is gone, skipping")
                }
                Err(err) if mode == ScanMode::Reload => {
                    tracing::warn!(container = id, "failed to inspect container: {}", err)
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to inspect container {id}"));
                }
            }
        }

        Ok(())
    }

    async fn reconcile(&self, details: ContainerDetails) {
        let id = short_id(&details.id).to_owned();
        let Some(pid) = details.pid() else {
            tracing::info!(container = id.as_str(), "container is not running, skipping");
            return;
        };

        let mounts = details.mount_requests(pid);
        let runtime = details.runtime_devices();
        let reconciler = Arc::clone(&self.reconciler);
        let pass = tokio::task::spawn_blocking(move || {
            reconciler.reconcile_container(&mounts, &runtime)
        });

        match pass.await {
            Ok(ReconcileReport {
                applied,
                skipped,
                failed,
            }) => {
                tracing::info!(
                    container = id.as_str(),
                    pid = pid.as_raw(),
                    applied,
                    skipped,
                    failed,
                    "reconciled container"
                );
            }
            Err(err) => tracing::error!(container = id.as_str(), "reconciliation panicked: {}", err),
        }
    }
}

/// SIGTERM and SIGINT streams, installed once so a signal that arrives while a
/// trigger is handled is seen on the next turn of the loop.
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn new() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

fn flatten(joined: Result<Result<(), RuntimeError>, tokio::task::JoinError>) -> Result<()> {
    Ok(joined.context("event listener panicked")??)
}

async fn forward_events(
    mut events: EventStream,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RuntimeError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            next = events.next() => match next? {
                Some(id) => {
                    tracing::debug!(container = short_id(&id), "container started");
                    if triggers.send(Trigger::ContainerStarted(id)).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Err(RuntimeError::StreamClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::*;

    async fn stream_events(body: &'static str) -> EventStream {
        let tmp = tempfile::tempdir().unwrap();
        let socket: PathBuf = tmp.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let _tmp = tmp;
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response =
                format!("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{body}");
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        DockerClient::new(socket).events().await.unwrap()
    }

    #[tokio::test]
    async fn test_forward_events_until_stream_closes() {
        let events = stream_events(
            "{\"status\":\"start\",\"id\":\"first\"}\n{\"status\":\"start\",\"id\":\"second\"}\n",
        )
        .await;
        let (trigger_tx, mut trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = forward_events(events, trigger_tx, shutdown_rx).await;

        assert!(matches!(result, Err(RuntimeError::StreamClosed)));
        assert_eq!(
            trigger_rx.recv().await,
            Some(Trigger::ContainerStarted("first".to_owned()))
        );
        assert_eq!(
            trigger_rx.recv().await,
            Some(Trigger::ContainerStarted("second".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_forward_events_stops_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            // keep the stream open until the client goes away
            let _ = stream.read(&mut buf).await;
        });
        let events = DockerClient::new(&socket).events().await.unwrap();
        let (trigger_tx, _trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarder = tokio::spawn(forward_events(events, trigger_tx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        assert!(forwarder.await.unwrap().is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_signal_raised_between_polls_is_kept() {
        let mut signals = ShutdownSignals::new().unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
        tokio::task::yield_now().await;

        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("SIGINT delivered");
        assert_eq!(name, "SIGINT");
    }
}
