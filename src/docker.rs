//! Docker backend — thin translation of the pool's backend contract onto the
//! Docker Engine API via bollard.
//!
//! The init call does not go through the engine at all: the runtime inside
//! the container listens on port 8080, so we resolve the container address
//! and speak HTTP/1.1 to it directly over a TcpStream.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::BytesMut;
use chrono::Utc;
use futures_util::stream::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::action::RunResult;
use crate::backend::{BackendError, Container, ContainerBackend, CreateOptions};

/// Port the action runtime listens on inside the container.
const RUNTIME_PORT: u16 = 8080;

/// How long to wait for the runtime to answer an init call.
const INIT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect to the engine. `localhost` means the local socket; anything
    /// else is treated as a remote engine on the conventional HTTP port.
    pub fn connect(endpoint: &str) -> Result<Self, BackendError> {
        let docker = if endpoint == "localhost" {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_http(&format!("http://{endpoint}:2375/"), 120, API_DEFAULT_VERSION)
        }
        .map_err(|e| BackendError::Runtime(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Resolve the address the runtime inside the container listens on.
    async fn container_ip(&self, container: &Container) -> Result<String, BackendError> {
        let inspect = self
            .docker
            .inspect_container(handle(container), None)
            .await
            .map_err(runtime_err)?;

        inspect
            .network_settings
            .and_then(|ns| {
                ns.networks.and_then(|nets| {
                    nets.into_values()
                        .find_map(|ep| ep.ip_address.filter(|ip| !ip.is_empty()))
                })
            })
            .ok_or_else(|| BackendError::Init(format!("no address for {}", container.name)))
    }
}

/// Engine-side reference for a container: runtime id once started, name
/// before that (stragglers are listed by name).
fn handle(container: &Container) -> &str {
    container.id.as_deref().unwrap_or(&container.name)
}

fn runtime_err(e: bollard::errors::Error) -> BackendError {
    BackendError::Runtime(e.to_string())
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn create(
        &self,
        name: &str,
        image: &str,
        opts: &CreateOptions,
    ) -> Result<Container, BackendError> {
        if opts.pull {
            debug!(image, "pulling image");
            let mut pull = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = pull.next().await {
                progress.map_err(|e| BackendError::Pull(e.to_string()))?;
            }
        }

        let config = Config {
            image: Some(image.to_string()),
            env: Some(opts.env.clone()),
            cmd: if opts.args.is_empty() {
                None
            } else {
                Some(opts.args.clone())
            },
            host_config: Some(HostConfig {
                network_mode: Some(opts.network.clone()),
                memory: Some((opts.limits.memory_mb * 1024 * 1024) as i64),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)?;

        debug!(name, id = %created.id, "container started");
        Ok(Container::new(created.id, name))
    }

    async fn init(&self, container: &Container, payload: &Value) -> Result<RunResult, BackendError> {
        let ip = self.container_ip(container).await?;
        let body = serde_json::to_vec(payload).map_err(|e| BackendError::Init(e.to_string()))?;

        let started_at = Utc::now();
        let response = tokio::time::timeout(INIT_TIMEOUT, async {
            let mut stream = TcpStream::connect((ip.as_str(), RUNTIME_PORT)).await?;
            let head = format!(
                "POST /init HTTP/1.1\r\nHost: {ip}:{RUNTIME_PORT}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body).await?;
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<_, std::io::Error>(raw)
        })
        .await;
        let ended_at = Utc::now();

        let response = match response {
            // Runtime never answered; the caller sees an empty result.
            Err(_elapsed) => None,
            Ok(raw) => {
                let raw = raw?;
                let text = String::from_utf8_lossy(&raw);
                let status = text.split_whitespace().nth(1).and_then(|s| s.parse::<i64>().ok());
                let body = text
                    .split_once("\r\n\r\n")
                    .map(|(_, b)| b.to_string())
                    .unwrap_or_default();
                status.map(|code| (if code == 200 { 0 } else { code }, body))
            }
        };

        Ok(RunResult {
            started_at,
            ended_at,
            response,
        })
    }

    async fn pause(&self, container: &Container) -> Result<(), BackendError> {
        self.docker
            .pause_container(handle(container))
            .await
            .map_err(runtime_err)
    }

    async fn unpause(&self, container: &Container) -> Result<(), BackendError> {
        self.docker
            .unpause_container(handle(container))
            .await
            .map_err(runtime_err)
    }

    async fn kill(&self, container: &Container) -> Result<(), BackendError> {
        self.docker
            .kill_container(handle(container), None::<KillContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn remove(&self, container: &Container) -> Result<(), BackendError> {
        self.docker
            .remove_container(
                handle(container),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(runtime_err)
    }

    async fn get_logs(&self, container: &Container) -> Result<String, BackendError> {
        let mut logs = self.docker.logs(
            handle(container),
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".into(),
                ..Default::default()
            }),
        );

        let mut buf = BytesMut::new();
        while let Some(chunk) = logs.next().await {
            let output = chunk.map_err(runtime_err)?;
            buf.extend_from_slice(&output.into_bytes());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn get_log_size(&self, container: &Container) -> Result<u64, BackendError> {
        // The engine exposes no size-only query; fetch and measure.
        Ok(self.get_logs(container).await?.len() as u64)
    }

    async fn list_all(&self) -> Result<Vec<Container>, BackendError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(runtime_err)?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                // Engine names carry a leading slash.
                let name = s
                    .names
                    .as_ref()?
                    .first()?
                    .trim_start_matches('/')
                    .to_string();
                Some(Container { id: s.id, name })
            })
            .collect())
    }
}
