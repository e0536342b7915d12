//! Minimal Docker Engine API client over the daemon's unix socket.
//!
//! Only the three calls the driver needs are implemented: listing running
//! containers, inspecting one, and following `start` events.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use libdevcgroups::device::{Access, DevicePattern};
use libdevcgroups::reconcile::{MappedDevice, MountRequest, RuntimeDevices};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const UNIX_SCHEME: &str = "unix://";
const CONTAINER_EVENT: &str = "container";
const START_ACTION: &str = "start";

type HyperClient = Client<UnixConnector, Empty<Bytes>>;

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("unsupported docker host {0}, only unix:// sockets are supported")]
    UnsupportedHost(String),
    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("request to {endpoint} failed: {err}")]
    Transport {
        endpoint: String,
        err: hyper_util::client::legacy::Error,
    },
    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("docker returned {status} for {endpoint}: {message}")]
    Status {
        endpoint: String,
        status: StatusCode,
        message: String,
    },
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("failed to decode docker response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("docker event stream closed")]
    StreamClosed,
}

/// Resolves the engine socket from a `DOCKER_HOST` style value.
pub fn socket_path(docker_host: Option<&str>) -> Result<PathBuf, RuntimeError> {
    match docker_host {
        None => Ok(PathBuf::from(DEFAULT_DOCKER_SOCKET)),
        Some(host) if host.is_empty() => Ok(PathBuf::from(DEFAULT_DOCKER_SOCKET)),
        Some(host) => match host.strip_prefix(UNIX_SCHEME) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(RuntimeError::UnsupportedHost(host.to_owned())),
        },
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Image", default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ContainerState {
    #[serde(rename = "Pid", default)]
    pub pid: i32,
    #[serde(rename = "Running", default)]
    pub running: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MountPoint {
    #[serde(rename = "Source", default)]
    pub source: PathBuf,
    #[serde(rename = "Destination", default)]
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<MountPoint>,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
}

/// Device settings the container was created with.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    #[serde(rename = "Privileged", default)]
    pub privileged: bool,
    // the engine sends null for both when unset
    #[serde(rename = "Devices", default)]
    pub devices: Option<Vec<DeviceMapping>>,
    #[serde(rename = "DeviceCgroupRules", default)]
    pub device_cgroup_rules: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DeviceMapping {
    #[serde(rename = "PathOnHost", default)]
    pub path_on_host: PathBuf,
    #[serde(rename = "PathInContainer", default)]
    pub path_in_container: PathBuf,
    #[serde(rename = "CgroupPermissions", default)]
    pub cgroup_permissions: String,
}

impl ContainerDetails {
    /// `None` when the container has no process any more.
    pub fn pid(&self) -> Option<Pid> {
        (self.state.pid > 0).then(|| Pid::from_raw(self.state.pid))
    }

    pub fn mount_requests(&self, pid: Pid) -> Vec<MountRequest> {
        self.mounts
            .iter()
            .map(|mount| MountRequest {
                container_id: self.id.clone(),
                pid,
                source: mount.source.clone(),
                destination: mount.destination.clone(),
            })
            .collect()
    }

    /// What the engine itself granted. Entries that do not parse are logged and left out.
    pub fn runtime_devices(&self) -> RuntimeDevices {
        let host = &self.host_config;

        let mut mapped = Vec::new();
        for device in host.devices.iter().flatten() {
            let permissions = device.cgroup_permissions.trim();
            let access = if permissions.is_empty() {
                Ok(Access::all())
            } else {
                permissions.parse::<Access>()
            };
            match access {
                Ok(access) => mapped.push(MappedDevice {
                    path_on_host: device.path_on_host.clone(),
                    access,
                }),
                Err(err) => tracing::warn!(
                    path = %device.path_on_host.display(),
                    "ignoring device mapping: {}",
                    err
                ),
            }
        }

        let mut rules = Vec::new();
        for rule in host.device_cgroup_rules.iter().flatten() {
            match rule.parse::<DevicePattern>() {
                Ok(pattern) => rules.push(pattern),
                Err(err) => tracing::warn!("ignoring device cgroup rule: {}", err),
            }
        }

        RuntimeDevices {
            privileged: host.privileged,
            mapped,
            rules,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "Type", default)]
    pub typ: Option<String>,
    #[serde(rename = "Action", default)]
    pub action: Option<String>,
    #[serde(rename = "Actor", default)]
    pub actor: Actor,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Event {
    /// The started container, if this is a container start event.
    pub fn started_container(&self) -> Option<&str> {
        if self.typ.as_deref().is_some_and(|typ| typ != CONTAINER_EVENT) {
            return None;
        }
        let action = self.action.as_deref().or(self.status.as_deref());
        if action != Some(START_ACTION) {
            return None;
        }

        if !self.actor.id.is_empty() {
            return Some(&self.actor.id);
        }
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Splits the newline-delimited JSON of the events endpoint into events. Chunks
/// may end anywhere, incomplete lines are kept until the rest arrives.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Event, serde_json::Error>> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line));
        }
        events
    }
}

/// Percent-encodes a query parameter value.
fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn events_endpoint() -> String {
    let filters = serde_json::json!({
        "type": [CONTAINER_EVENT],
        "event": [START_ACTION],
    });
    format!("/events?filters={}", encode_query_value(&filters.to_string()))
}

pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn get(&self, endpoint: &str) -> Result<Response<Incoming>, RuntimeError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let req = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Empty::<Bytes>::new())?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|err| RuntimeError::Transport {
                endpoint: endpoint.to_owned(),
                err,
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.into_body().collect().await?.to_bytes();
            return Err(RuntimeError::Status {
                endpoint: endpoint.to_owned(),
                status,
                message: String::from_utf8_lossy(&body).trim().to_owned(),
            });
        }

        Ok(res)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, RuntimeError> {
        let body = self.get(endpoint).await?.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }

    /// Running containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.get_json("/containers/json").await
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        match self.get_json(&format!("/containers/{id}/json")).await {
            Err(RuntimeError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                Err(RuntimeError::NotFound(id.to_owned()))
            }
            result => result,
        }
    }

    /// Subscribes to container start events.
    pub async fn events(&self) -> Result<EventStream, RuntimeError> {
        let res = self.get(&events_endpoint()).await?;

        Ok(EventStream {
            body: res.into_body(),
            decoder: EventDecoder::default(),
            pending: VecDeque::new(),
        })
    }
}

pub struct EventStream {
    body: Incoming,
    decoder: EventDecoder,
    pending: VecDeque<String>,
}

impl EventStream {
    /// Next started container id, `None` once the engine closes the stream.
    /// Undecodable lines are logged and skipped.
    pub async fn next(&mut self) -> Result<Option<String>, RuntimeError> {
        loop {
            if let Some(id) = self.pending.pop_front() {
                return Ok(Some(id));
            }

            let Some(frame) = self.body.frame().await else {
                return Ok(None);
            };
            let Ok(data) = frame?.into_data() else {
                continue;
            };

            for event in self.decoder.push(&data) {
                match event {
                    Ok(event) => {
                        if let Some(id) = event.started_container() {
                            self.pending.push_back(id.to_owned());
                        }
                    }
                    Err(err) => tracing::warn!("skipping undecodable docker event: {}", err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::*;

    const CONTAINER_ID: &str = "4f66ad7b7c3a9e1d0b2c6e8a5f7d9c1b3a5e7f9d1c3b5a7e9f1d3c5b7a9e1f3d";

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(None).unwrap(),
            PathBuf::from("/var/run/docker.sock")
        );
        assert_eq!(
            socket_path(Some("")).unwrap(),
            PathBuf::from("/var/run/docker.sock")
        );
        assert_eq!(
            socket_path(Some("unix:///run/user/1000/docker.sock")).unwrap(),
            PathBuf::from("/run/user/1000/docker.sock")
        );
        for host in ["tcp://127.0.0.1:2375", "unix://", "/var/run/docker.sock"] {
            assert!(matches!(
                socket_path(Some(host)),
                Err(RuntimeError::UnsupportedHost(_))
            ));
        }
    }

    #[test]
    fn test_events_endpoint() {
        assert_eq!(
            events_endpoint(),
            "/events?filters=%7B%22event%22%3A%5B%22start%22%5D%2C%22type%22%3A%5B%22container%22%5D%7D"
        );
    }

    #[test]
    fn test_decode_inspect() -> Result<()> {
        let details: ContainerDetails = serde_json::from_str(&format!(
            r#"{{
                "Id": "{CONTAINER_ID}",
                "State": {{"Status": "running", "Running": true, "Pid": 4242}},
                "Mounts": [
                    {{"Type": "bind", "Source": "/dev/dri", "Destination": "/dev/dri", "RW": true}},
                    {{"Type": "volume", "Name": "data", "Source": "/var/lib/docker/volumes/data/_data", "Destination": "/data"}}
                ],
                "Image": "sha256:0123"
            }}"#
        ))?;

        let pid = details.pid().expect("running container");
        let mounts = details.mount_requests(pid);

        assert_eq!(pid, Pid::from_raw(4242));
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].container_id, CONTAINER_ID);
        assert_eq!(mounts[0].source, PathBuf::from("/dev/dri"));
        assert_eq!(mounts[1].destination, PathBuf::from("/data"));
        Ok(())
    }

    #[test]
    fn test_stopped_container_has_no_pid() -> Result<()> {
        let details: ContainerDetails =
            serde_json::from_str(r#"{"Id": "abc", "State": {"Running": false, "Pid": 0}}"#)?;

        assert_eq!(details.pid(), None);
        assert!(details.mounts.is_empty());
        assert_eq!(details.runtime_devices(), RuntimeDevices::default());
        Ok(())
    }

    #[test]
    fn test_runtime_devices() -> Result<()> {
        let details: ContainerDetails = serde_json::from_str(
            r#"{
                "Id": "abc",
                "State": {"Running": true, "Pid": 4242},
                "HostConfig": {
                    "Privileged": false,
                    "Devices": [
                        {"PathOnHost": "/dev/ttyUSB0", "PathInContainer": "/dev/ttyUSB0", "CgroupPermissions": "rwm"},
                        {"PathOnHost": "/dev/sda", "PathInContainer": "/dev/xvda", "CgroupPermissions": "r"},
                        {"PathOnHost": "/dev/fuse", "PathInContainer": "/dev/fuse", "CgroupPermissions": ""},
                        {"PathOnHost": "/dev/bogus", "PathInContainer": "/dev/bogus", "CgroupPermissions": "rx"}
                    ],
                    "DeviceCgroupRules": ["c 188:* rwm", "a *:* m", "c 188 rwm"]
                }
            }"#,
        )?;

        let runtime = details.runtime_devices();

        assert!(!runtime.privileged);
        assert_eq!(
            runtime.mapped,
            vec![
                MappedDevice {
                    path_on_host: PathBuf::from("/dev/ttyUSB0"),
                    access: Access::all(),
                },
                MappedDevice {
                    path_on_host: PathBuf::from("/dev/sda"),
                    access: Access::READ,
                },
                MappedDevice {
                    path_on_host: PathBuf::from("/dev/fuse"),
                    access: Access::all(),
                },
            ]
        );
        assert_eq!(
            runtime.rules,
            vec!["c 188:* rwm".parse::<DevicePattern>()?, "a *:* m".parse()?]
        );
        Ok(())
    }

    #[test]
    fn test_privileged_with_null_device_lists() -> Result<()> {
        let details: ContainerDetails = serde_json::from_str(
            r#"{
                "Id": "abc",
                "HostConfig": {"Privileged": true, "Devices": null, "DeviceCgroupRules": null}
            }"#,
        )?;

        let runtime = details.runtime_devices();

        assert!(runtime.privileged);
        assert!(runtime.mapped.is_empty());
        assert!(runtime.rules.is_empty());
        Ok(())
    }

    #[test]
    fn test_event_decoder_split_chunks() {
        let mut decoder = EventDecoder::default();
        let line = format!(
            r#"{{"status":"start","id":"{CONTAINER_ID}","Type":"container","Action":"start","Actor":{{"ID":"{CONTAINER_ID}","Attributes":{{"image":"busybox"}}}},"time":1}}"#
        );
        let (head, tail) = line.split_at(40);

        assert!(decoder.push(head.as_bytes()).is_empty());
        let events = decoder.push(format!("{tail}\n\n").as_bytes());

        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().expect("decode event");
        assert_eq!(event.started_container(), Some(CONTAINER_ID));
    }

    #[test]
    fn test_event_decoder_reports_garbage() {
        let mut decoder = EventDecoder::default();

        let events = decoder.push(b"not json\n{\"Type\":\"container\",\"Action\":\"start\",\"id\":\"abc\"}\n");

        assert_eq!(events.len(), 2);
        assert!(events[0].is_err());
        assert_eq!(
            events[1].as_ref().unwrap().started_container(),
            Some("abc")
        );
    }

    #[test]
    fn test_only_container_starts_are_reported() -> Result<()> {
        for (json, expected) in [
            (r#"{"Type":"container","Action":"die","Actor":{"ID":"abc"}}"#, None),
            (r#"{"Type":"network","Action":"start","Actor":{"ID":"abc"}}"#, None),
            (r#"{"status":"start","id":"abc"}"#, Some("abc")),
            (r#"{"Type":"container","Action":"start","Actor":{"ID":""}}"#, None),
        ] {
            let event: Event = serde_json::from_str(json)?;
            assert_eq!(event.started_container(), expected, "{json}");
        }
        Ok(())
    }

    /// Serves one canned response per connection and closes it.
    async fn serve(listener: UnixListener, responses: Vec<(&'static str, String)>) {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}"
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_client_against_engine() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let socket = tmp.path().join("docker.sock");
        let listener = UnixListener::bind(&socket)?;
        let server = tokio::spawn(serve(
            listener,
            vec![
                (
                    "200 OK",
                    format!(r#"[{{"Id":"{CONTAINER_ID}","Image":"busybox"}}]"#),
                ),
                (
                    "404 Not Found",
                    r#"{"message":"No such container: gone"}"#.to_owned(),
                ),
                (
                    "200 OK",
                    format!(
                        "{{\"Type\":\"container\",\"Action\":\"start\",\"Actor\":{{\"ID\":\"{CONTAINER_ID}\"}}}}\n{{\"status\":\"start\",\"id\":\"second\"}}\n"
                    ),
                ),
            ],
        ));
        let client = DockerClient::new(&socket);

        let containers = client.list_containers().await?;
        assert_eq!(
            containers,
            vec![ContainerSummary {
                id: CONTAINER_ID.to_owned(),
                image: "busybox".to_owned(),
            }]
        );

        assert!(matches!(
            client.inspect_container("gone").await,
            Err(RuntimeError::NotFound(id)) if id == "gone"
        ));

        let mut events = client.events().await?;
        assert_eq!(events.next().await?, Some(CONTAINER_ID.to_owned()));
        assert_eq!(events.next().await?, Some("second".to_owned()));
        assert_eq!(events.next().await?, None);

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_client_without_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let client = DockerClient::new(tmp.path().join("missing.sock"));

        assert!(matches!(
            client.list_containers().await,
            Err(RuntimeError::Transport { .. })
        ));
    }
}
