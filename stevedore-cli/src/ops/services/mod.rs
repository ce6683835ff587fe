//! Service listing and inspection.

mod config;
mod lifecycle;

use super::output::{print_json, OutputFormat};
use super::ui::{
    format_state, format_uptime, print_empty, print_header, print_hint, print_kv,
    print_kv_colored, print_section, print_table_header, truncate, KvColor,
};
use crossterm::style::Stylize;
use serde_json::json;
use stevedore_core::{ExecutionMode, Orchestrator, ServiceState};

pub use config::{override_service, reset_parameter, set_mode, set_parameter, OverrideTarget};
pub use lifecycle::{restart_service, start_service, status_service, stop_all_services, stop_service};

/// List services with their live state.
pub async fn list_services(orch: &Orchestrator, output: OutputFormat) -> anyhow::Result<()> {
    let services = orch.list_services().await;

    match output {
        OutputFormat::Json => print_json(&services)?,
        OutputFormat::Table => {
            print_header("📋 SERVICE LIST");

            if services.is_empty() {
                print_empty(&format!(
                    "No services found. Describe them in {}.",
                    orch.data_dir().join(stevedore_core::DOCUMENT_FILE).display()
                ));
                return Ok(());
            }

            let running = services
                .iter()
                .filter(|s| s.state == ServiceState::Running)
                .count();
            println!(
                "  Total: {}  |  {} Running  |  {} Stopped",
                services.len().to_string().white().bold(),
                running.to_string().green(),
                (services.len() - running).to_string().dark_grey()
            );
            println!();

            print_table_header(&[("ID", 16), ("NAME", 20), ("MODE", 10), ("INSTANCE", 22), ("STATUS", 14)]);
            for svc in &services {
                println!(
                    "  {:<16} {:<20} {:<10} {:<22} {}",
                    svc.id.as_str().cyan(),
                    truncate(&svc.name, 18),
                    svc.mode.as_str(),
                    truncate(&svc.instance, 20),
                    format_state(svc.state)
                );
            }
            println!();
            print_hint("Use 'show <id>' to see service details");
        }
    }
    Ok(())
}

/// Effective configuration plus live status of one service.
pub async fn show_service(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    let service = orch.service(id).await?;
    let defaults = orch.registry().await.defaults().clone();
    let status = orch.status(id).await.ok();
    let command = match service.execution_mode {
        ExecutionMode::Container => stevedore_core::synth::synthesize_command(&service),
        ExecutionMode::Process => {
            let mut tokens: Vec<String> = service.process_binary().map(str::to_string).into_iter().collect();
            tokens.extend(stevedore_core::synth::parameter_arguments(&service));
            tokens
        }
    };

    match output {
        OutputFormat::Json => print_json(&json!({
            "service": service,
            "instance": service.instance_name(&defaults),
            "command": command,
            "status": status,
        }))?,
        OutputFormat::Table => {
            print_header(&format!("📦 SERVICE: {}", id.to_uppercase()));

            print_section("Configuration");
            print_kv_colored("Name", &service.name, KvColor::White);
            if let Some(desc) = service.description.as_deref() {
                print_kv("Description", desc);
            }
            print_kv_colored("Mode", service.execution_mode.as_str(), KvColor::Yellow);
            print_kv_colored("Instance", &service.instance_name(&defaults), KvColor::Cyan);
            match service.execution_mode {
                ExecutionMode::Container => {
                    if let Some(image) = service.image() {
                        print_kv_colored("Image", &image.reference(), KvColor::Cyan);
                    }
                    print_kv("Network", &service.network(&defaults));
                }
                ExecutionMode::Process => {
                    if let Some(release) = service.release() {
                        print_kv_colored("Release", &release.version, KvColor::Cyan);
                    }
                    print_kv_colored("Directory", &orch.service_dir(id).display().to_string(), KvColor::Grey);
                }
            }
            print_kv("Command", &shell_join(&command));

            if !service.parameters.is_empty() {
                print_section("Parameters");
                for param in service.parameters.iter().filter(|p| !p.hidden) {
                    let value = param.display_value().unwrap_or_else(|| "-".to_string());
                    let marker = if param.has_user_value() { "*" } else { " " };
                    println!(
                        "  {}{:<20} {:<10} {}",
                        marker.yellow(),
                        param.name.as_str().green(),
                        param.kind.as_str().dark_grey(),
                        value
                    );
                }
            }

            if !service.ports.is_empty() || !service.volumes.is_empty() || !service.environment.is_empty() {
                print_section("Bindings");
                for port in &service.ports {
                    let host = port
                        .effective_host_port()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "not mapped".to_string());
                    println!("    {} port {} → {}", "•".dark_grey(), host, port.container_port);
                }
                for volume in &service.volumes {
                    let host = volume.effective_host_path().unwrap_or("not mounted");
                    println!("    {} volume {} → {}", "•".dark_grey(), host, volume.container_path);
                }
                for env in &service.environment {
                    let value = env.display_value().unwrap_or_default();
                    println!("    {} {} = {}", "•".dark_grey(), env.name.as_str().green(), value);
                }
            }

            if !service.custom_commands.is_empty() {
                print_section("Commands");
                for cmd in &service.custom_commands {
                    println!(
                        "    {} {:<16} {}",
                        "•".dark_grey(),
                        cmd.id.as_str().cyan(),
                        cmd.label.as_deref().unwrap_or("")
                    );
                }
            }

            if let Some(status) = status {
                print_section("Runtime Status");
                println!("  {:<14} {}", "Status:".dark_grey(), format_state(status.state));
                if let Some(pid) = status.pid {
                    print_kv_colored("PID", &pid.to_string(), KvColor::Cyan);
                }
                if let Some(uptime) = status.uptime_ms {
                    print_kv_colored("Uptime", &format_uptime(uptime), KvColor::Green);
                }
            }
            println!();
        }
    }
    Ok(())
}

fn shell_join(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| {
            if t.is_empty() || t.contains(char::is_whitespace) {
                format!("{t:?}")
            } else {
                t.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::shell_join;

    #[test]
    fn quotes_tokens_with_spaces() {
        let tokens = vec!["bitcoind".to_string(), "-rpcuser=a b".to_string(), String::new()];
        assert_eq!(shell_join(&tokens), "bitcoind \"-rpcuser=a b\" \"\"");
    }
}
