use super::output::{print_json, OutputFormat};
use super::ui::{print_header, print_hint, print_info, print_section};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal;
use serde_json::json;
use std::io::{self, Write};
use std::time::Duration;
use stevedore_core::Orchestrator;

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

/// Tail logs.
pub async fn logs_service(
    orch: &Orchestrator,
    id: &str,
    tail: usize,
    follow: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    if follow {
        return follow_logs(orch, id, tail).await;
    }

    let content = orch.logs(id, tail).await?;
    let lines: Vec<&str> = content.lines().collect();

    match output {
        OutputFormat::Json => print_json(&json!({ "id": id, "lines": lines }))?,
        OutputFormat::Table => {
            print_header(&format!("📜 LOGS: {}", id.to_uppercase()));

            if lines.is_empty() {
                print_section("Log Output");
                println!();
                println!("  {}", "No logs available.".dark_grey().italic());
                println!();
            } else {
                print_info(&format!(
                    "Showing last {} lines",
                    lines.len().to_string().cyan()
                ));
                println!();
                println!("  {}", "─".repeat(60).dark_grey());

                for line in &lines {
                    println!("  {}", line);
                }

                println!("  {}", "─".repeat(60).dark_grey());
            }
            println!();
            print_hint(&format!("Use 'logs {} -f' to follow logs in real-time", id));
            println!();
        }
    }
    Ok(())
}

/// 轮询日志尾部，只输出新增行；Ctrl+Q 退出。
async fn follow_logs(orch: &Orchestrator, id: &str, tail: usize) -> anyhow::Result<()> {
    print_header(&format!("📜 FOLLOW LOGS: {}", id.to_uppercase()));
    print_info("Following logs. Press Ctrl+Q to stop.");
    println!();
    println!("  {}", "─".repeat(60).dark_grey());

    // 启用原始模式以捕获键盘事件
    terminal::enable_raw_mode()?;
    let result = follow_loop(orch, id, tail).await;
    terminal::disable_raw_mode()?;

    println!();
    println!("  {}\r", "─".repeat(60).dark_grey());
    print_info("Log follow stopped.");
    println!("\r");
    result
}

async fn follow_loop(orch: &Orchestrator, id: &str, tail: usize) -> anyhow::Result<()> {
    let mut previous: Vec<String> = Vec::new();
    let mut next_poll = tokio::time::Instant::now();

    loop {
        if event::poll(Duration::from_millis(10))? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.modifiers.contains(KeyModifiers::CONTROL)
                    && key_event.code == KeyCode::Char('q')
                {
                    return Ok(());
                }
            }
        }

        if tokio::time::Instant::now() >= next_poll {
            let current: Vec<String> = orch.logs(id, tail).await?.lines().map(str::to_string).collect();
            let mut stdout = io::stdout();
            for line in new_lines(&previous, &current) {
                // 原始模式下需要显式回车
                let _ = write!(stdout, "  {}\r\n", line);
            }
            let _ = stdout.flush();
            previous = current;
            next_poll = tokio::time::Instant::now() + FOLLOW_INTERVAL;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Lines of `next` not already shown: skips the longest suffix of `prev` that `next` starts with.
fn new_lines<'a>(prev: &[String], next: &'a [String]) -> &'a [String] {
    let max = prev.len().min(next.len());
    let overlap = (0..=max)
        .rev()
        .find(|&k| prev[prev.len() - k..] == next[..k])
        .unwrap_or(0);
    &next[overlap..]
}

#[cfg(test)]
mod tests {
    use super::new_lines;

    fn lines(s: &[&str]) -> Vec<String> {
        s.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn only_appended_lines_are_new() {
        let prev = lines(&["a", "b", "c"]);
        let next = lines(&["b", "c", "d", "e"]);
        assert_eq!(new_lines(&prev, &next), lines(&["d", "e"]).as_slice());
    }

    #[test]
    fn first_poll_and_rotated_log_show_everything() {
        assert_eq!(new_lines(&[], &lines(&["a"])), lines(&["a"]).as_slice());
        let prev = lines(&["x", "y"]);
        let next = lines(&["fresh"]);
        assert_eq!(new_lines(&prev, &next), next.as_slice());
    }

    #[test]
    fn unchanged_tail_prints_nothing() {
        let prev = lines(&["a", "b"]);
        assert!(new_lines(&prev, &prev.clone()).is_empty());
    }
}
