//! Custom commands declared by a service, run inside its live instance.

use super::output::{print_json, OutputFormat};
use super::ui::{print_error, print_header, print_kv_colored, print_section, print_success, KvColor};
use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Input, Password};
use serde_json::json;
use std::collections::HashMap;
use std::io::IsTerminal;
use stevedore_core::document::{CommandInput, InputKind};
use stevedore_core::Orchestrator;

/// Run `command_id` on `id`. Inputs not given with `-i` are prompted for on a terminal.
pub async fn run_command(
    orch: &Orchestrator,
    id: &str,
    command_id: &str,
    given: Vec<(String, String)>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let service = orch.service(id).await?;
    let command = service
        .custom_command(command_id)
        .ok_or_else(|| anyhow::anyhow!("{id} has no command '{command_id}'"))?
        .clone();

    let mut inputs: HashMap<String, String> = given.into_iter().collect();
    let missing: Vec<CommandInput> = command
        .inputs
        .iter()
        .filter(|i| !inputs.contains_key(&i.name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        if !std::io::stdin().is_terminal() || output == OutputFormat::Json {
            let names: Vec<&str> = missing.iter().map(|i| i.name.as_str()).collect();
            anyhow::bail!("missing inputs: {}", names.join(", "));
        }
        for input in missing {
            let name = input.name.clone();
            let value = tokio::task::spawn_blocking(move || prompt_input(&input)).await??;
            inputs.insert(name, value);
        }
    }

    let result = orch.run_custom_command(id, command_id, &inputs).await?;

    match output {
        OutputFormat::Json => print_json(&json!({
            "id": id,
            "command": command_id,
            "exitCode": result.exit_code,
            "output": result.output,
        }))?,
        OutputFormat::Table => {
            let title = command.label.as_deref().unwrap_or(command_id);
            print_header(&format!("⚙️  {}: {}", id.to_uppercase(), title));
            print_kv_colored(
                "Exit code",
                &result.exit_code.to_string(),
                if result.success() { KvColor::Green } else { KvColor::Yellow },
            );
            print_section("Output");
            for line in result.output.lines() {
                println!("  {}", line);
            }
            if result.output.trim().is_empty() {
                println!("  {}", "(no output)".dark_grey().italic());
            }
            println!();
            if result.success() {
                print_success("Command completed");
            } else {
                print_error("Command exited with a non-zero status");
            }
            println!();
        }
    }

    if !result.success() {
        anyhow::bail!("command '{command_id}' exited with {}", result.exit_code);
    }
    Ok(())
}

fn prompt_input(input: &CommandInput) -> anyhow::Result<String> {
    let theme = ColorfulTheme::default();
    let prompt = input.prompt.clone().unwrap_or_else(|| input.name.clone());
    if input.kind == InputKind::Secret {
        return Ok(Password::with_theme(&theme).with_prompt(prompt).interact()?);
    }
    let mut builder = Input::<String>::with_theme(&theme).with_prompt(prompt);
    if let Some(default) = input.default.clone() {
        builder = builder.default(default);
    }
    Ok(builder.interact_text()?)
}

/// `key=value` for `-i`.
pub fn parse_input(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty input name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
