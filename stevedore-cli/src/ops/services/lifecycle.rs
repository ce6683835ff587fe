//! Service lifecycle operations: start, stop, restart, status, stop-all.

use crate::ops::output::{print_json, OutputFormat};
use crate::ops::ui::{
    finish_progress_error, finish_progress_success, format_state, format_uptime, print_empty,
    print_error, print_header, print_hint, print_kv_colored, print_progress, print_section,
    print_success, print_warning, KvColor,
};
use crossterm::style::Stylize;
use serde_json::json;
use stevedore_core::{Orchestrator, ServiceStatus, StopOutcome};
use tracing::warn;

/// Start service.
pub async fn start_service(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    if output == OutputFormat::Json {
        let status = orch.start(id).await?;
        return print_json(&status);
    }

    print_header(&format!("▶️  START SERVICE: {}", id.to_uppercase()));
    print_progress("Starting service");
    match orch.start(id).await {
        Ok(status) => {
            finish_progress_success("Service started");
            println!();
            print_service_status(&status);
            println!();
            print_hint(&format!("Use 'logs {}' to view recent output", id));
            Ok(())
        }
        Err(e) => {
            finish_progress_error("Failed to start");
            println!();
            print_error(&e.to_string());
            if e.is_binary_missing() {
                print_hint(&format!("Use 'versions {id}' and 'install {id}' to fetch a binary"));
            }
            Err(e.into())
        }
    }
}

/// Stop service. Stopping a stopped service is reported, not failed.
pub async fn stop_service(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    if output == OutputFormat::Json {
        let outcome = orch.stop(id).await?;
        return print_json(&json!({ "id": id, "outcome": outcome }));
    }

    print_header(&format!("⏹️  STOP SERVICE: {}", id.to_uppercase()));
    print_progress("Stopping service");
    match orch.stop(id).await {
        Ok(StopOutcome::Stopped) => {
            finish_progress_success("Service stopped");
            println!();
            print_success(&format!("Service '{}' has been stopped.", id));
        }
        Ok(StopOutcome::AlreadyStopped) => {
            finish_progress_success("Nothing to stop");
            println!();
            print_warning(&format!("Service '{}' was not running.", id));
        }
        Err(e) => {
            finish_progress_error("Failed to stop");
            println!();
            print_error(&e.to_string());
            return Err(e.into());
        }
    }
    println!();
    Ok(())
}

/// Restart service.
pub async fn restart_service(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    if output == OutputFormat::Json {
        let status = orch.restart(id).await?;
        return print_json(&status);
    }

    print_header(&format!("🔄 RESTART SERVICE: {}", id.to_uppercase()));
    print_progress("Restarting service");
    match orch.restart(id).await {
        Ok(status) => {
            finish_progress_success("Service restarted");
            println!();
            print_service_status(&status);
            println!();
            print_success(&format!("Service '{}' has been restarted.", id));
            println!();
            Ok(())
        }
        Err(e) => {
            finish_progress_error("Failed to restart");
            println!();
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}

/// Query status.
pub async fn status_service(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    let status = orch.status(id).await?;

    match output {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            print_header(&format!("📊 STATUS: {}", id.to_uppercase()));
            print_service_status(&status);
            println!();
            if status.is_running() {
                print_hint(&format!("Use 'logs {}' to view recent logs", id));
            } else {
                print_hint(&format!("Use 'start {}' to start the service", id));
            }
            println!();
        }
    }
    Ok(())
}

/// Stop every running service.
pub async fn stop_all_services(orch: &Orchestrator, output: OutputFormat) -> anyhow::Result<()> {
    let results = orch.stop_all().await;
    let mut failed = 0;
    for (id, result) in &results {
        if let Err(e) = result {
            warn!(service_id = %id, error = %e, "stop failed");
            failed += 1;
        }
    }

    match output {
        OutputFormat::Json => {
            let rows: Vec<_> = results
                .iter()
                .map(|(id, result)| match result {
                    Ok(outcome) => json!({ "id": id, "outcome": outcome }),
                    Err(e) => json!({ "id": id, "error": e.to_string() }),
                })
                .collect();
            print_json(&rows)?;
        }
        OutputFormat::Table => {
            print_header("⏹️  STOP ALL SERVICES");
            if results.is_empty() {
                print_empty("No running services.");
                return Ok(());
            }
            for (id, result) in &results {
                match result {
                    Ok(_) => print_success(&format!("{} stopped", id.as_str().cyan())),
                    Err(e) => print_error(&format!("{}: {}", id, e)),
                }
            }
            println!();
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} service(s) failed to stop");
    }
    Ok(())
}

fn print_service_status(status: &ServiceStatus) {
    print_section("Service Status");
    println!("  {:<14} {}", "Status:".dark_grey(), format_state(status.state));
    if let Some(pid) = status.pid {
        print_kv_colored("PID", &pid.to_string(), KvColor::Cyan);
    }
    if let Some(uptime_ms) = status.uptime_ms {
        print_kv_colored("Uptime", &format_uptime(uptime_ms), KvColor::Green);
    }
}
