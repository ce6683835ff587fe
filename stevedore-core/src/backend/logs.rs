//! 本地进程日志：输出转发落盘、尾部读取、超限截断。

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use std::sync::Arc;

/// 日志文件最大大小（2MB），超过此值触发截断
pub(super) const LOG_MAX_SIZE: u64 = 2 * 1024 * 1024;
/// 截断后保留的大小（1MB）
pub(super) const LOG_RETAIN_SIZE: u64 = 1024 * 1024;
/// 每写入多少字节检查一次文件大小
const LOG_CHECK_BYTES: u64 = 10 * 1024;

/// 返回日志末尾 N 行。
pub(super) fn tail_lines(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    if !path.exists() || lines == 0 {
        return Ok(vec![]);
    }
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let mut pos: u64 = meta.len();
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut newline_count = 0usize;
    const CHUNK_SIZE: u64 = 8 * 1024;

    while pos > 0 && newline_count <= lines {
        let read_size = CHUNK_SIZE.min(pos);
        pos -= read_size;
        file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size as usize];
        file.read_exact(&mut buf)?;

        // 从尾部开始计数，找到开始位置后截断
        let mut boundary = None;
        for (idx, &b) in buf.iter().enumerate().rev() {
            if b == b'\n' {
                newline_count += 1;
                if newline_count > lines {
                    boundary = Some(idx + 1);
                    break;
                }
            }
        }

        match boundary {
            Some(start) => {
                chunks.push(buf.split_off(start));
                break;
            }
            None => chunks.push(buf),
        }
    }

    chunks.reverse();
    let data: Vec<u8> = chunks.concat();

    let mut result: Vec<String> = data
        .split_inclusive(|&b| b == b'\n')
        .map(decode_line)
        .collect();

    if result.len() > lines {
        let drop = result.len() - lines;
        result.drain(0..drop);
    }
    Ok(result)
}

/// 后台转发 stdout/stderr：逐行写入日志文件，超限时截断。
pub(super) fn spawn_output_forward<R>(reader: R, writer: Arc<Mutex<Option<tokio::fs::File>>>, log_path: PathBuf)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::task::spawn(async move {
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buf = Vec::new();
        let mut written: u64 = 0;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut guard = writer.lock().await;
                    if let Some(file) = guard.as_mut() {
                        let _ = file.write_all(&buf).await;
                        let _ = file.flush().await;
                    }
                    written += n as u64;

                    // 定期检查文件大小，超限则截断后重新打开
                    if written >= LOG_CHECK_BYTES {
                        written = 0;
                        let too_big = tokio::fs::metadata(&log_path)
                            .await
                            .map(|m| m.len() > LOG_MAX_SIZE)
                            .unwrap_or(false);
                        if too_big {
                            drop(guard.take());
                            let path = log_path.clone();
                            let _ = tokio::task::spawn_blocking(move || {
                                truncate_log_file(&path, LOG_RETAIN_SIZE)
                            })
                            .await;
                            *guard = open_append(&log_path).await;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });
}

pub(super) async fn open_append(path: &Path) -> Option<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()
}

/// 追加一行说明（启动 / 退出记录）。
pub(super) fn append_note(path: &Path, note: &str) {
    let _ = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{note}"));
}

/// 截断日志文件，保留末尾指定大小的内容
pub(super) fn truncate_log_file(path: &Path, retain_size: u64) {
    let Ok(mut file) = File::open(path) else {
        return;
    };
    let Ok(metadata) = file.metadata() else {
        return;
    };
    let file_size = metadata.len();
    if file_size <= retain_size {
        return;
    }

    if file.seek(SeekFrom::Start(file_size - retain_size)).is_err() {
        return;
    }
    let mut retained = Vec::with_capacity(retain_size as usize);
    if file.read_to_end(&mut retained).is_err() {
        return;
    }
    drop(file);

    // 调整到行边界：跳过第一个不完整的行
    let line_start = retained
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    if let Ok(mut file) = File::create(path) {
        let _ = file.write_all(b"[... log truncated ...]\n");
        let _ = file.write_all(&retained[line_start..]);
    }
}

/// 尝试从 UTF-8 解码，否则回退 GB18030；移除行尾换行。
fn decode_line(raw: &[u8]) -> String {
    let mut s = match std::str::from_utf8(raw) {
        Ok(v) => v.to_string(),
        Err(_) => {
            let (cow, _, had_errors) = encoding_rs::GB18030.decode(raw);
            if had_errors {
                String::from_utf8_lossy(raw).to_string()
            } else {
                cow.to_string()
            }
        }
    };
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.log");
        let content: String = (1..=50).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();

        let lines = tail_lines(&path, 3).unwrap();
        assert_eq!(lines, vec!["line 48", "line 49", "line 50"]);
    }

    #[test]
    fn tail_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(tail_lines(&dir.path().join("none.log"), 10).unwrap().is_empty());
    }

    #[test]
    fn tail_without_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.log");
        std::fs::write(&path, "a\nb\nc").unwrap();
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn truncate_keeps_tail_on_line_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.log");
        let content: String = (0..1000).map(|i| format!("entry {i:04}\n")).collect();
        std::fs::write(&path, &content).unwrap();

        truncate_log_file(&path, 100);
        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.starts_with("[... log truncated ...]\n"));
        assert!(after.ends_with("entry 0999\n"));
        assert!(after.len() < content.len());
        for line in after.lines().skip(1) {
            assert!(line.starts_with("entry "));
        }
    }

    #[test]
    fn decode_falls_back_to_gb18030() {
        // "中文" in GB18030
        let raw = [0xD6, 0xD0, 0xCE, 0xC4, b'\n'];
        assert_eq!(decode_line(&raw), "中文");
    }
}
