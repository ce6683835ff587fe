//! Version discovery, selection and release installation.

use super::output::{print_json, OutputFormat};
use super::ui::{
    finish_progress_error, finish_progress_success, print_empty, print_error, print_header,
    print_hint, print_kv_colored, print_progress, print_success, print_table_header, KvColor,
};
use crossterm::style::Stylize;
use serde_json::json;
use stevedore_core::{ExecutionMode, Orchestrator, VersionCandidate};

pub async fn list_versions(orch: &Orchestrator, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    let service = orch.service(id).await?;
    let candidates = orch.discover_versions(id).await?;
    let current = match service.execution_mode {
        ExecutionMode::Container => service.image().map(VersionCandidate::Image),
        ExecutionMode::Process => service.release().map(VersionCandidate::Release),
    };

    match output {
        OutputFormat::Json => print_json(&json!({
            "id": id,
            "current": current,
            "candidates": candidates,
        }))?,
        OutputFormat::Table => {
            print_header(&format!("🏷️  VERSIONS: {}", id.to_uppercase()));
            if candidates.is_empty() {
                print_empty("No versions available.");
                return Ok(());
            }
            print_table_header(&[("", 2), ("VERSION", 24), ("SOURCE", 44)]);
            for candidate in &candidates {
                let marker = if Some(candidate) == current.as_ref() { "●" } else { " " };
                let (version, source) = match candidate {
                    VersionCandidate::Image(image) => (image.tag.clone(), image.reference()),
                    VersionCandidate::Release(release) => (
                        candidate.label(),
                        release.url.clone(),
                    ),
                };
                println!("  {:<2} {:<24} {}", marker.green(), version.as_str().cyan(), source.dark_grey());
            }
            println!();
            print_hint(&format!("Use 'use-version {id} <version>' to select one"));
            println!();
        }
    }
    Ok(())
}

/// 按版本号或标签选中候选；`reset` 回到声明的默认版本。
pub async fn use_version(
    orch: &Orchestrator,
    id: &str,
    version: Option<&str>,
    reset: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    if reset {
        orch.reset_version(id).await?;
        return match output {
            OutputFormat::Json => print_json(&json!({ "id": id, "version": null })),
            OutputFormat::Table => {
                print_success(&format!("{id}: version reset to default"));
                Ok(())
            }
        };
    }

    let Some(version) = version else {
        anyhow::bail!("provide a version or --reset");
    };
    let candidates = orch.discover_versions(id).await?;
    let candidate = pick_candidate(&candidates, version)
        .ok_or_else(|| anyhow::anyhow!("{id}: no version matching '{version}'"))?
        .clone();
    let label = candidate.label();
    let is_release = matches!(candidate, VersionCandidate::Release(_));
    orch.select_version(id, candidate.clone()).await?;

    match output {
        OutputFormat::Json => print_json(&json!({ "id": id, "version": candidate }))?,
        OutputFormat::Table => {
            print_success(&format!("{id}: selected {label}"));
            if is_release {
                print_hint(&format!("Use 'install {id}' to download it"));
            } else {
                print_hint(&format!("Takes effect on the next 'start {id}'"));
            }
        }
    }
    Ok(())
}

/// Download the selected (or named) release into the service directory.
pub async fn install_service(
    orch: &Orchestrator,
    id: &str,
    version: Option<&str>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let release = match version {
        Some(version) => {
            let candidates = orch.discover_versions(id).await?;
            match pick_candidate(&candidates, version) {
                Some(VersionCandidate::Release(release)) => Some(release.clone()),
                _ => anyhow::bail!("{id}: no release matching '{version}'"),
            }
        }
        None => None,
    };

    if output == OutputFormat::Json {
        let path = orch.install_release(id, release).await?;
        return print_json(&json!({ "id": id, "binary": path }));
    }

    print_header(&format!("📦 INSTALL: {}", id.to_uppercase()));
    print_progress("Downloading release");
    match orch.install_release(id, release).await {
        Ok(path) => {
            finish_progress_success("Release installed");
            println!();
            print_kv_colored("Binary", &path.display().to_string(), KvColor::Cyan);
            println!();
            print_hint(&format!("Use 'start {id}' to run it"));
            Ok(())
        }
        Err(e) => {
            finish_progress_error("Install failed");
            println!();
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}

fn pick_candidate<'a>(candidates: &'a [VersionCandidate], wanted: &str) -> Option<&'a VersionCandidate> {
    candidates.iter().find(|c| match c {
        VersionCandidate::Image(image) => image.tag == wanted || image.reference() == wanted,
        VersionCandidate::Release(release) => release.version == wanted,
    })
}
