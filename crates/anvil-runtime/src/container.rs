use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Mutex;

use anvil_core::config::ContainerConfig;
use anvil_core::error::{AnvilError, Result};
use bollard::models::{
    ContainerCreateBody, HostConfig, Ipam, IpamConfig, NetworkCreateRequest, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectNetworkOptionsBuilder,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::warn;

const MANAGED_BY_LABEL: &str = "managed-by";
const MANAGED_BY_VALUE: &str = "anvil";

pub struct CreateContainerRequest {
    pub instance_id: String,
    pub challenge_slug: String,
    pub image: String,
    pub tag: String,
    pub registry: Option<String>,
    pub exposed_ports: Vec<u16>,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub extra_labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

pub struct CreatedContainer {
    pub container_id: String,
    pub name: String,
    pub ip: Option<String>,
    pub port_mappings: std::collections::BTreeMap<u16, u16>,
}

/// Docker challenge backend. Owns one dedicated bridge network and a
/// host port allocator shared across every container it creates.
pub struct ContainerService {
    docker: Docker,
    config: ContainerConfig,
    used_ports: Mutex<HashSet<u16>>,
}

impl ContainerService {
    pub fn new(docker: Docker, config: ContainerConfig) -> Self {
        Self {
            docker,
            config,
            used_ports: Mutex::new(HashSet::new()),
        }
    }

    /// Creates the lab bridge network if it doesn't already exist.
    /// Tolerant of a concurrent creator winning the race.
    async fn ensure_network(&self) -> Result<()> {
        let inspect_options = InspectNetworkOptionsBuilder::new().build();
        if self
            .docker
            .inspect_network(&self.config.network_name, Some(inspect_options))
            .await
            .is_ok()
        {
            return Ok(());
        }
        let result = self
            .docker
            .create_network(NetworkCreateRequest {
                name: self.config.network_name.clone(),
                driver: Some("bridge".to_string()),
                ipam: Some(Ipam {
                    config: Some(vec![IpamConfig {
                        subnet: Some(self.config.network_subnet.clone()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(AnvilError::Upstream {
                message: format!("create network {}: {e}", self.config.network_name),
            }),
        }
    }

    /// Scans the configured port range, skipping ports already marked
    /// used, and bind-probes each candidate to reject a collider outside
    /// our own pool (e.g. some other process squatting the port).
    fn allocate_port(&self) -> Result<u16> {
        let mut used = self.used_ports.lock().unwrap();
        for port in self.config.port_range_start..=self.config.port_range_end {
            if used.contains(&port) {
                continue;
            }
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                used.insert(port);
                return Ok(port);
            }
        }
        Err(AnvilError::Exhausted {
            message: "no free host port in configured range".to_string(),
        })
    }

    fn release_port(&self, port: u16) {
        self.used_ports.lock().unwrap().remove(&port);
    }

    fn release_ports(&self, ports: &[u16]) {
        let mut used = self.used_ports.lock().unwrap();
        for p in ports {
            used.remove(p);
        }
    }

    pub async fn create_instance(&self, req: CreateContainerRequest) -> Result<CreatedContainer> {
        self.ensure_network().await?;

        let image_ref = match &req.registry {
            Some(registry) => format!("{registry}/{}:{}", req.image, req.tag),
            None => format!("{}:{}", req.image, req.tag),
        };

        self.pull_image(&image_ref).await?;

        let mut allocated_ports = Vec::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_mappings = std::collections::BTreeMap::new();
        for container_port in &req.exposed_ports {
            match self.allocate_port() {
                Ok(host_port) => {
                    allocated_ports.push(host_port);
                    let key = format!("{container_port}/tcp");
                    port_bindings.insert(
                        key.clone(),
                        Some(vec![PortBinding {
                            host_ip: None,
                            host_port: Some(host_port.to_string()),
                        }]),
                    );
                    exposed_ports.insert(key, HashMap::new());
                    port_mappings.insert(*container_port, host_port);
                }
                Err(e) => {
                    self.release_ports(&allocated_ports);
                    return Err(e);
                }
            }
        }

        let nano_cpus = parse_cpu_limit(&req.cpu_limit)?;
        let memory_bytes = parse_memory_limit(&req.memory_limit)?;

        let mut labels = req.extra_labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert("anvil.instance-id".to_string(), req.instance_id.clone());
        labels.insert("anvil.challenge-slug".to_string(), req.challenge_slug.clone());

        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let name = format!("anvil-{}", req.instance_id);

        let body = ContainerCreateBody {
            image: Some(image_ref),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: Some(self.config.network_name.clone()),
                nano_cpus: Some(nano_cpus),
                memory: Some(memory_bytes),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(3),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_result = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.clone()),
                    platform: None,
                }),
                body,
            )
            .await;

        let container_id = match create_result {
            Ok(res) => res.id,
            Err(e) => {
                self.release_ports(&allocated_ports);
                return Err(AnvilError::Upstream {
                    message: format!("create container {name}: {e}"),
                });
            }
        };

        if let Err(e) = self.docker.start_container(&container_id, None::<StartContainerOptions>).await {
            self.release_ports(&allocated_ports);
            self.remove_container_best_effort(&container_id).await;
            return Err(AnvilError::Upstream {
                message: format!("start container {name}: {e}"),
            });
        }

        let ip = match self.docker.inspect_container(&container_id, None).await {
            Ok(inspect) => inspect
                .network_settings
                .and_then(|ns| ns.networks)
                .and_then(|nets| nets.get(&self.config.network_name).cloned())
                .and_then(|n| n.ip_address),
            Err(_) => None,
        };

        Ok(CreatedContainer {
            container_id,
            name,
            ip,
            port_mappings,
        })
    }

    async fn pull_image(&self, image_ref: &str) -> Result<()> {
        let (image, tag) = image_ref.rsplit_once(':').unwrap_or((image_ref, "latest"));
        let options = CreateImageOptionsBuilder::new().from_image(image).tag(tag).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            item.map_err(|e| AnvilError::Upstream {
                message: format!("pull image {image_ref}: {e}"),
            })?;
        }
        Ok(())
    }

    async fn remove_container_best_effort(&self, container_id: &str) {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container_id, error = %e, "failed to remove container during compensating cleanup");
        }
    }

    pub async fn start_instance(&self, container_id: &str) -> Result<()> {
        match self.docker.start_container(container_id, None::<StartContainerOptions>).await {
            Ok(_) => Ok(()),
            Err(e) => Err(AnvilError::Upstream {
                message: format!("start container {container_id}: {e}"),
            }),
        }
    }

    pub async fn stop_instance(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptionsBuilder::new().t(10).build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("404") => Ok(()),
            Err(e) => Err(AnvilError::Upstream {
                message: format!("stop container {container_id}: {e}"),
            }),
        }
    }

    pub async fn remove_instance(&self, container_id: &str) -> Result<()> {
        let host_ports: Vec<u16> = match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .host_config
                .and_then(|hc| hc.port_bindings)
                .map(|bindings| {
                    bindings
                        .values()
                        .flatten()
                        .flatten()
                        .filter_map(|b| b.host_port.as_ref().and_then(|p| p.parse().ok()))
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(_) | Err(_) => {
                self.release_ports(&host_ports);
                Ok(())
            }
        }
    }

    /// Lists `managed-by=anvil` containers with no matching live instance
    /// id and removes them. Callers pass the set of instance ids the
    /// store currently considers live (non-terminal, docker-kind).
    pub async fn cleanup(&self, live_instance_ids: &HashSet<String>) -> Result<usize> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        )]);
        let options = ListContainersOptionsBuilder::new().all(true).filters(&filters).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| AnvilError::Upstream { message: format!("list managed containers: {e}") })?;

        let mut reaped = 0;
        for container in containers {
            let instance_id = container
                .labels
                .as_ref()
                .and_then(|l| l.get("anvil.instance-id"))
                .cloned();
            let orphan = match &instance_id {
                Some(id) => !live_instance_ids.contains(id),
                None => true,
            };
            if orphan {
                if let Some(id) = container.id {
                    self.remove_instance(&id).await.ok();
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }
}

/// Parses a CPU limit like `"1"` or `"0.5"` into Docker's nanocpus unit.
fn parse_cpu_limit(raw: &str) -> Result<i64> {
    let cores: f64 = raw
        .parse()
        .map_err(|_| AnvilError::Validation { message: format!("invalid cpu limit: {raw}") })?;
    if cores <= 0.0 {
        return Err(AnvilError::Validation { message: format!("cpu limit must be positive: {raw}") });
    }
    Ok((cores * 1_000_000_000.0).round() as i64)
}

/// Parses a memory limit like `"512m"` or `"1g"` into bytes.
fn parse_memory_limit(raw: &str) -> Result<i64> {
    let lower = raw.to_lowercase();
    let (digits, multiplier) = if let Some(stripped) = lower.strip_suffix('g') {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix('m') {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix('k') {
        (stripped, 1024)
    } else {
        (lower.as_str(), 1)
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| AnvilError::Validation { message: format!("invalid memory limit: {raw}") })?;
    Ok(value * multiplier)
}
