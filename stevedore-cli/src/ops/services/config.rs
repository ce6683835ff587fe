//! Parameter and override editing. Every edit is written through to the document.

use crate::ops::output::{print_json, OutputFormat};
use crate::ops::ui::{print_error, print_hint, print_success};
use serde_json::json;
use stevedore_core::{ExecutionMode, Orchestrator};

/// Which override an `override` command edits. `None` values reset to the default.
#[derive(Debug, Clone)]
pub enum OverrideTarget {
    Name(Option<String>),
    Network(Option<String>),
    Port { container_port: u16, host_port: Option<u16> },
    Volume { container_path: String, host_path: Option<String> },
    Env { name: String, value: Option<String> },
}

impl OverrideTarget {
    fn describe(&self) -> String {
        fn show<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "default".to_string())
        }
        match self {
            Self::Name(v) => format!("name → {}", show(v)),
            Self::Network(v) => format!("network → {}", show(v)),
            Self::Port { container_port, host_port } => format!("port {container_port} → {}", show(host_port)),
            Self::Volume { container_path, host_path } => format!("volume {container_path} → {}", show(host_path)),
            // values may be secrets
            Self::Env { name, value } => match value {
                Some(_) => format!("env {name} updated"),
                None => format!("env {name} → default"),
            },
        }
    }
}

fn report(output: OutputFormat, id: &str, what: &str, result: anyhow::Result<()>) -> anyhow::Result<()> {
    match (&result, output) {
        (Ok(()), OutputFormat::Json) => print_json(&json!({ "id": id, "updated": what }))?,
        (Ok(()), OutputFormat::Table) => print_success(&format!("{id}: {what}")),
        (Err(e), OutputFormat::Table) => print_error(&e.to_string()),
        (Err(_), OutputFormat::Json) => {}
    }
    result
}

pub async fn set_parameter(
    orch: &Orchestrator,
    id: &str,
    name: &str,
    value: &str,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let result = orch.set_parameter(id, name, value).await.map_err(Into::into);
    let masked = orch
        .service(id)
        .await
        .ok()
        .and_then(|s| s.parameter(name).and_then(|p| p.display_value()))
        .unwrap_or_default();
    report(output, id, &format!("{name} = {masked}"), result)
}

pub async fn reset_parameter(orch: &Orchestrator, id: &str, name: &str, output: OutputFormat) -> anyhow::Result<()> {
    let result = orch.reset_parameter(id, name).await.map_err(Into::into);
    report(output, id, &format!("{name} reset"), result)
}

pub async fn override_service(
    orch: &Orchestrator,
    id: &str,
    target: OverrideTarget,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let what = target.describe();
    let result = {
        let mut registry = orch.registry().await;
        match target {
            OverrideTarget::Name(v) => registry.set_name_override(id, v).await,
            OverrideTarget::Network(v) => registry.set_network_override(id, v).await,
            OverrideTarget::Port { container_port, host_port } => {
                registry.set_port_override(id, container_port, host_port).await
            }
            OverrideTarget::Volume { container_path, host_path } => {
                registry.set_volume_override(id, &container_path, host_path).await
            }
            OverrideTarget::Env { name, value } => registry.set_env_override(id, &name, value).await,
        }
    };
    let result = report(output, id, &what, result.map_err(Into::into));
    if result.is_ok() && output == OutputFormat::Table {
        print_hint(&format!("Changes take effect on the next 'start {id}'"));
    }
    result
}

pub async fn set_mode(orch: &Orchestrator, id: &str, mode: &str, output: OutputFormat) -> anyhow::Result<()> {
    let mode: ExecutionMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let result = orch.set_execution_mode(id, mode).await.map_err(Into::into);
    report(output, id, &format!("mode → {}", mode.as_str()), result)
}
