//! Docker runtime using the bollard crate

use crate::{
    AttachedIo, BuildManager, BuildOptions, ContainerId, ContainerRuntime, ContainerStatus,
    CreateContainerConfig, FirewallConfig, ImageId, LogEntry, LogSource, LogStream, MountKind,
    NetworkManager, PortBindingInfo, Result, RuntimeError, RuntimeInfo, RuntimeKind,
    ServiceManager, ServiceSpec, SidecarManager,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::network::{CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions};
use bollard::service::{HostConfig, Mount, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;

/// BuildKit daemon image used for build sidecars
const BUILDKIT_IMAGE: &str = "moby/buildkit:v0.13.2";

/// Docker runtime driver
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify it responds
    pub async fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?
        } else {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?
        };

        client
            .ping()
            .await
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Get the underlying Docker client
    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub async fn info(&self) -> Result<RuntimeInfo> {
        let version = self.client.version().await?;
        Ok(RuntimeInfo {
            kind: RuntimeKind::Docker,
            version: version.version.unwrap_or_default(),
        })
    }

    /// Run a shell script in the container as root, failing on non-zero exit
    async fn exec_script(&self, id: &ContainerId, script: &str) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]),
            user: Some("root".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(&id.0, options).await?;

        let start_options = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let result = self.client.start_exec(&exec.id, Some(start_options)).await?;

        let mut output_str = String::new();
        if let StartExecResults::Attached { mut output, .. } = result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::StdErr { message }) => {
                        output_str.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);
        if exit_code != 0 {
            return Err(RuntimeError::ExecError(format!(
                "script exited with code {}: {}",
                exit_code,
                output_str.trim()
            )));
        }
        Ok(output_str)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, config: &CreateContainerConfig) -> Result<ContainerId> {
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        });

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = PortBinding {
                host_ip: None,
                host_port: port.host_port.map(|p| p.to_string()),
            };
            port_bindings.insert(container_port, Some(vec![binding]));
        }

        let mounts: Vec<Mount> = config
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(match m.kind {
                    MountKind::Bind => bollard::service::MountTypeEnum::BIND,
                    MountKind::Volume => bollard::service::MountTypeEnum::VOLUME,
                    MountKind::Tmpfs => bollard::service::MountTypeEnum::TMPFS,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: config.network_mode.clone(),
            extra_hosts: if config.extra_hosts.is_empty() {
                None
            } else {
                Some(config.extra_hosts.clone())
            },
            privileged: Some(config.privileged),
            cap_add: if config.cap_add.is_empty() {
                None
            } else {
                Some(config.cap_add.clone())
            },
            group_add: if config.group_add.is_empty() {
                None
            } else {
                Some(config.group_add.clone())
            },
            nano_cpus: config.cpus.map(|c| (c * 1e9) as i64),
            memory: config.memory_bytes,
            ..Default::default()
        };

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            hostname: config.hostname.clone(),
            tty: Some(config.tty),
            open_stdin: Some(config.stdin_open),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(options, container_config)
            .await?;

        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn start_attached(&self, id: &ContainerId) -> Result<AttachedIo> {
        // Attach first so the stream is connected before PID 1 runs
        let attach = self
            .client
            .attach_container(
                &id.0,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await?;

        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;

        Ok(AttachedIo {
            stdin: attach.input,
            output: Box::pin(LogOutputReader::new(attach.output)),
        })
    }

    async fn attach_container(&self, id: &ContainerId) -> Result<AttachedIo> {
        let attach = self
            .client
            .attach_container(
                &id.0,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await?;
        Ok(AttachedIo {
            stdin: attach.input,
            output: Box::pin(LogOutputReader::new(attach.output)),
        })
    }

    async fn stop_container(&self, id: &ContainerId, timeout_secs: Option<u32>) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout_secs.unwrap_or(10) as i64,
        };
        match self.client.stop_container(&id.0, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<i64> {
        let mut stream = self.client.wait_container(
            &id.0,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard surfaces non-zero exits as an error variant
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::WaitError(e.to_string())),
            None => Err(RuntimeError::WaitError(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn container_state(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let info = match self.client.inspect_container(&id.0, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(RuntimeError::ContainerNotFound(id.0.clone())),
            Err(e) => return Err(e.into()),
        };
        let status = info
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(format!("{:?}", s).to_lowercase().as_str()))
            .unwrap_or(ContainerStatus::Unknown);
        Ok(status)
    }

    async fn container_logs(
        &self,
        id: &ContainerId,
        follow: bool,
        tail: Option<u64>,
    ) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let stream = self.client.logs(&id.0, Some(options));
        let mapped = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message })
                | Ok(bollard::container::LogOutput::Console { message }) => Some(Ok(LogEntry {
                    stream: LogSource::Stdout,
                    message: String::from_utf8_lossy(&message).to_string(),
                })),
                Ok(bollard::container::LogOutput::StdErr { message }) => Some(Ok(LogEntry {
                    stream: LogSource::Stderr,
                    message: String::from_utf8_lossy(&message).to_string(),
                })),
                Ok(_) => None,
                Err(e) => Some(Err(RuntimeError::from(e))),
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn container_logs_all(&self, id: &ContainerId) -> Result<Vec<LogEntry>> {
        let mut stream = self.container_logs(id, false, None).await?;
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    async fn resize_tty(&self, id: &ContainerId, height: u16, width: u16) -> Result<()> {
        self.client
            .resize_container_tty(&id.0, ResizeContainerTtyOptions { height, width })
            .await?;
        Ok(())
    }

    async fn setup_firewall(&self, id: &ContainerId, config: &FirewallConfig) -> Result<()> {
        let mut script = String::from(
            "set -e\n\
             iptables -A OUTPUT -o lo -j ACCEPT\n\
             iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n\
             iptables -A OUTPUT -p udp --dport 53 -j ACCEPT\n\
             iptables -A OUTPUT -p tcp --dport 53 -j ACCEPT\n",
        );
        script.push_str(&format!(
            "iptables -A OUTPUT -p tcp -d {} --dport {} -j ACCEPT\n",
            config.proxy_host, config.proxy_port
        ));
        for host in &config.allowed_hosts {
            script.push_str(&format!("iptables -A OUTPUT -d {} -j ACCEPT\n", host));
        }
        script.push_str("iptables -P OUTPUT DROP\n");

        self.exec_script(id, &script).await?;
        Ok(())
    }

    async fn get_port_bindings(&self, id: &ContainerId) -> Result<Vec<PortBindingInfo>> {
        let info = self.client.inspect_container(&id.0, None).await?;
        let mut bindings = Vec::new();

        let ports = info
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default();

        for (container_port, host_bindings) in ports {
            let Some((port_str, protocol)) = container_port.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port_str.parse::<u16>() else {
                continue;
            };
            for binding in host_bindings.unwrap_or_default() {
                if let Some(host_port) = binding.host_port.and_then(|p| p.parse::<u16>().ok()) {
                    bindings.push(PortBindingInfo {
                        container_port,
                        host_port,
                        protocol: protocol.to_string(),
                    });
                }
            }
        }

        Ok(bindings)
    }

    async fn get_image_home_dir(&self, image: &str) -> Result<Option<String>> {
        let inspect = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| RuntimeError::ImageNotFound(e.to_string()))?;

        let config = match inspect.config {
            Some(config) => config,
            None => return Ok(None),
        };

        // Prefer an explicit HOME; fall back to the conventional path
        if let Some(env) = &config.env {
            for entry in env {
                if let Some(home) = entry.strip_prefix("HOME=") {
                    return Ok(Some(home.to_string()));
                }
            }
        }

        Ok(match config.user.as_deref() {
            None | Some("") | Some("root") | Some("0") => Some("/root".to_string()),
            Some(user) if user.chars().all(|c| c.is_ascii_digit() || c == ':') => None,
            Some(user) => {
                let name = user.split(':').next().unwrap_or(user);
                Some(format!("/home/{}", name))
            }
        })
    }

    fn get_host_address(&self) -> String {
        "host.docker.internal".to_string()
    }

    fn supports_host_network(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    fn networks(&self) -> Option<&dyn NetworkManager> {
        Some(self)
    }

    fn services(&self) -> Option<&dyn ServiceManager> {
        Some(self)
    }

    fn sidecars(&self) -> Option<&dyn SidecarManager> {
        Some(self)
    }

    fn builds(&self) -> Option<&dyn BuildManager> {
        Some(self)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for DockerRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        let response = self.client.create_network(options).await?;
        Ok(response.id.unwrap_or_else(|| name.to_string()))
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.client.remove_network(id).await?;
        Ok(())
    }

    async fn disconnect_all(&self, id: &str) -> Result<()> {
        let network = self
            .client
            .inspect_network(
                id,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await?;

        for container_id in network.containers.unwrap_or_default().into_keys() {
            let options = DisconnectNetworkOptions {
                container: container_id.clone(),
                force: true,
            };
            if let Err(e) = self.client.disconnect_network(id, options).await {
                tracing::warn!("Failed to disconnect {} from {}: {}", container_id, id, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for DockerRuntime {
    async fn start_service(&self, spec: &ServiceSpec) -> Result<ContainerId> {
        let config = CreateContainerConfig {
            image: spec.image.clone(),
            name: Some(spec.name.clone()),
            env: spec.env.clone(),
            hostname: Some(spec.alias.clone()),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };
        let id = self.create_container(&config).await?;
        self.start_container(&id).await?;
        Ok(id)
    }

    async fn stop_service(&self, id: &ContainerId) -> Result<()> {
        self.stop_container(id, Some(5)).await
    }

    async fn remove_service(&self, id: &ContainerId) -> Result<()> {
        self.remove_container(id, true).await
    }
}

#[async_trait]
impl SidecarManager for DockerRuntime {
    async fn start_buildkit(&self, network: &str, alias: &str) -> Result<ContainerId> {
        let config = CreateContainerConfig {
            image: BUILDKIT_IMAGE.to_string(),
            name: Some(alias.to_string()),
            hostname: Some(alias.to_string()),
            network_mode: Some(network.to_string()),
            privileged: true,
            ..Default::default()
        };
        let id = self.create_container(&config).await?;
        self.start_container(&id).await?;
        Ok(id)
    }

    async fn stop_sidecar(&self, id: &ContainerId) -> Result<()> {
        self.stop_container(id, Some(5)).await
    }
}

#[async_trait]
impl BuildManager for DockerRuntime {
    async fn build_image(
        &self,
        dockerfile: &str,
        tag: &str,
        opts: &BuildOptions,
    ) -> Result<ImageId> {
        let tar_data = dockerfile_context(dockerfile)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            buildargs: opts.build_args.clone(),
            nocache: opts.no_cache,
            pull: opts.pull,
            labels: opts.labels.clone(),
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(tar_data.into()));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(RuntimeError::BuildError(error));
                    }
                    if let Some(aux) = output.aux {
                        if let Some(id) = aux.id {
                            image_id = Some(id);
                        }
                    }
                    if let Some(msg) = output.stream {
                        tracing::debug!("{}", msg.trim());
                    }
                }
                Err(e) => return Err(RuntimeError::BuildError(e.to_string())),
            }
        }

        // Some daemons omit the aux record; the tag is equally addressable
        Ok(image_id.map(ImageId::new).unwrap_or_else(|| ImageId::new(tag)))
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.client.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.client.remove_image(tag, None, None).await?;
        Ok(())
    }
}

/// Build a tar context containing only the Dockerfile
fn dockerfile_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let bytes = dockerfile.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;

    let data = builder.into_inner()?;
    let mut flushed = Vec::with_capacity(data.len());
    flushed.write_all(&data)?;
    Ok(flushed)
}

/// Adapts a bollard LogOutput stream into a contiguous AsyncRead
struct LogOutputReader<S> {
    stream: S,
    buffer: Vec<u8>,
    offset: usize,
}

impl<S> LogOutputReader<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            offset: 0,
        }
    }
}

impl<S> tokio::io::AsyncRead for LogOutputReader<S>
where
    S: futures::Stream<
            Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>,
        > + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        loop {
            if self.offset < self.buffer.len() {
                let remaining = &self.buffer[self.offset..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.offset += n;
                return std::task::Poll::Ready(Ok(()));
            }

            match futures::Stream::poll_next(std::pin::Pin::new(&mut self.stream), cx) {
                std::task::Poll::Ready(Some(Ok(output))) => {
                    let message = match output {
                        bollard::container::LogOutput::StdOut { message } => message,
                        bollard::container::LogOutput::StdErr { message } => message,
                        bollard::container::LogOutput::StdIn { message } => message,
                        bollard::container::LogOutput::Console { message } => message,
                    };
                    self.buffer = message.to_vec();
                    self.offset = 0;
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )));
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(Ok(())),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}
