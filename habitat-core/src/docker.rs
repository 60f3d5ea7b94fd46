//! Thin async wrapper over the docker CLI.
//!
//! The node talks to the daemon through the `docker` binary rather than its
//! socket. Daemon "No such container" and "No such image" replies surface as
//! [`HabitatError::NotFound`]; every other failure is an external driver error.

use crate::error::{HabitatError, Result};
use std::process::Output;
use tokio::process::Command;

/// Label that ties a container to its node process.
pub const PROCESS_LABEL: &str = "habitat_proc_id";

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub process_id: String,
    pub env: Vec<String>,
    pub mounts: Vec<String>,
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("Running {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|error| {
                HabitatError::ExternalDriver(format!("Failed to run {}: {}", self.binary, error))
            })
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            );
            if is_missing(&stderr) {
                return Err(HabitatError::NotFound(message));
            }
            return Err(HabitatError::ExternalDriver(message));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Container id carrying the process label, running or not.
    pub async fn find_container(&self, process_id: &str) -> Result<Option<String>> {
        let stdout = self
            .run(&args(&[
                "ps",
                "--all",
                "--quiet",
                "--filter",
                &format!("label={}={}", PROCESS_LABEL, process_id),
            ]))
            .await?;
        Ok(stdout.lines().next().map(str::to_string))
    }

    pub async fn is_running(&self, container_id: &str) -> Result<bool> {
        let stdout = self
            .run(&args(&["inspect", "--format", "{{.State.Running}}", container_id]))
            .await?;
        Ok(stdout == "true")
    }

    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut command = args(&[
            "create",
            "--label",
            &format!("{}={}", PROCESS_LABEL, spec.process_id),
        ]);
        for env in &spec.env {
            command.push("--env".to_string());
            command.push(env.clone());
        }
        for mount in &spec.mounts {
            command.push("--volume".to_string());
            command.push(mount.clone());
        }
        for port in &spec.exposed_ports {
            command.push("--publish".to_string());
            command.push(port.clone());
        }
        command.push(spec.image.clone());
        self.run(&command).await
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.run(&args(&["start", container_id])).await.map(|_| ())
    }

    /// Stops and removes a container. A missing container is not an error.
    pub async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        for command in [
            args(&["stop", container_id]),
            args(&["rm", "--force", container_id]),
        ] {
            let output = self.output(&command).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if is_missing(&stderr) {
                    tracing::debug!("Container {} is already gone", container_id);
                    return Ok(());
                }
                return Err(HabitatError::ExternalDriver(format!(
                    "docker {} {} failed: {}",
                    command[0],
                    container_id,
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.output(&args(&["image", "inspect", image])).await?;
        Ok(output.status.success())
    }

    pub async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!("Pulling image {}", image);
        self.run(&args(&["pull", image])).await.map(|_| ())
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        let output = self.output(&args(&["image", "rm", image])).await?;
        if output.status.success() || is_missing(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(());
        }
        Err(HabitatError::ExternalDriver(format!(
            "docker image rm {} failed: {}",
            image,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such image")
}

/// `<registry_url_base>/<registry_app_id>:<registry_tag>`, skipping empty parts.
pub fn image_reference(
    registry_url_base: &str,
    registry_app_id: &str,
    registry_tag: &str,
) -> String {
    let base = registry_url_base.trim_end_matches('/');
    let repository = if base.is_empty() {
        registry_app_id.to_string()
    } else {
        format!("{}/{}", base, registry_app_id)
    };
    if registry_tag.is_empty() {
        repository
    } else {
        format!("{}:{}", repository, registry_tag)
    }
}
