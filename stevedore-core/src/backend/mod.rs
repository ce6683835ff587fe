//! Execution backends: one contract, two implementations (container engine CLI and
//! native processes). The orchestrator picks one per service from its execution mode.

use crate::document::{ExecutionMode, LogRotation, OutputPolicy};
use crate::error::{Result, ServiceError};
use crate::models::{ExecOutput, ServiceStatus, StopOutcome};
use async_trait::async_trait;

mod container;
mod logs;
mod process;
mod runner;

pub use container::ContainerBackend;
pub use process::{ProcessBackend, ProcessHandle};
pub use runner::{CommandOutput, CommandRunner, TokioCommandRunner};

/// Uniform lifecycle contract shared by both execution modes.
#[async_trait]
pub trait Backend: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Fails with `BackendUnavailable` when the runtime cannot be reached.
    async fn ensure_available(&self) -> Result<()>;

    /// Create and start an instance; succeeds only once it is observed running.
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceStatus>;

    /// Stop an instance. Stopping a stopped instance yields `AlreadyStopped`.
    async fn stop(&self, name: &str) -> Result<StopOutcome>;

    async fn status(&self, name: &str) -> Result<ServiceStatus>;

    /// Last `tail` lines of output.
    async fn logs(&self, name: &str, tail: usize) -> Result<String>;

    /// Run a literal command against the running instance.
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput>;
}

/// Everything a backend needs to launch one instance.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub service_id: String,
    /// Container name, or the process registry key.
    pub name: String,
    /// Image reference (container) or binary file name (process).
    pub target: String,
    pub env: Vec<EnvBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub ports: Vec<PortBinding>,
    pub command: Vec<String>,
    pub network: Option<String>,
    pub working_dir: Option<String>,
    pub gpu: bool,
    pub restart_policy: Option<String>,
    pub log_rotation: Option<LogRotation>,
    pub output: OutputPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
    pub protocol: Option<String>,
}

impl PortBinding {
    /// `host:container[/proto]` as passed to `-p`.
    pub fn to_arg(&self) -> String {
        match self.protocol.as_deref().filter(|p| !p.is_empty()) {
            Some(proto) => format!("{}:{}/{}", self.host, self.container, proto),
            None => format!("{}:{}", self.host, self.container),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host: String,
    pub container: String,
    pub read_only: bool,
    pub is_file: bool,
}

impl VolumeBinding {
    /// `host:container[:ro]` as passed to `-v`.
    pub fn to_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host, self.container)
        } else {
            format!("{}:{}", self.host, self.container)
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EnvBinding {
    pub name: String,
    pub value: String,
    pub sensitive: bool,
}

impl EnvBinding {
    pub fn to_arg(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    /// Same as `to_arg` but safe to log.
    pub fn masked(&self) -> String {
        if self.sensitive {
            format!("{}=***", self.name)
        } else {
            self.to_arg()
        }
    }
}

impl std::fmt::Debug for EnvBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Names end up in external command lines; only `[A-Za-z0-9][A-Za-z0-9_.-]*` is accepted.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && name.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_allow_list() {
        assert!(validate_name("stevedore-node").is_ok());
        assert!(validate_name("a.b_c-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("x; rm -rf /").is_err());
        assert!(validate_name("$(whoami)").is_err());
        assert!(validate_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn binding_args() {
        let port = PortBinding {
            host: 1,
            container: 2,
            protocol: Some("udp".into()),
        };
        assert_eq!(port.to_arg(), "1:2/udp");
        let vol = VolumeBinding {
            host: "/h".into(),
            container: "/c".into(),
            read_only: true,
            is_file: false,
        };
        assert_eq!(vol.to_arg(), "/h:/c:ro");
        let env = EnvBinding {
            name: "PASS".into(),
            value: "pw".into(),
            sensitive: true,
        };
        assert_eq!(env.to_arg(), "PASS=pw");
        assert_eq!(format!("{env:?}"), "PASS=***");
    }
}
