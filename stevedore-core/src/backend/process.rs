//! 本地进程后端：在服务目录中启动可执行文件，维护存活进程表。
//!
//! 进程表只在确认启动后插入、确认退出后删除；退出回调与主动 stop 谁先观察到退出谁删除，
//! 后到者找不到条目即视为已清理。启动期间 id 先登记在 `starting` 中，同一 id 的并发启动
//! 在观察窗口结束前即被拒绝。

use super::logs::{append_note, open_append, spawn_output_forward, tail_lines};
use super::{validate_name, Backend, LaunchSpec};
use crate::document::{ExecutionMode, OutputPolicy};
use crate::error::{Result, ServiceError};
use crate::models::{ExecOutput, ServiceState, ServiceStatus, StopOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

/// 启动后观察窗口：窗口内退出视为启动失败
const START_GRACE: Duration = Duration::from_millis(500);
/// 优雅停止最长等待
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// 强制终止后最长等待
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// exec 命令超时
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 已确认启动的进程。
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub service_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// 退出后由等待任务写入退出码（被信号终止时为 None）
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl ProcessHandle {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessBackend {
    services_dir: PathBuf,
    handles: Arc<Mutex<HashMap<String, ProcessHandle>>>,
    /// 正在启动（尚未通过观察窗口）的 id
    starting: Arc<StdMutex<HashSet<String>>>,
    system: Arc<StdMutex<System>>,
    start_grace: Duration,
    stop_timeout: Duration,
    kill_timeout: Duration,
}

impl ProcessBackend {
    /// `services_dir` 下每个服务一个目录：`<services_dir>/<id>/<binary>`
    pub fn new<P: AsRef<Path>>(services_dir: P) -> Self {
        Self {
            services_dir: services_dir.as_ref().to_path_buf(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            starting: Arc::new(StdMutex::new(HashSet::new())),
            system: Arc::new(StdMutex::new(System::new())),
            start_grace: START_GRACE,
            stop_timeout: STOP_TIMEOUT,
            kill_timeout: KILL_TIMEOUT,
        }
    }

    /// 调整启动观察窗口与停止超时。
    pub fn with_timeouts(mut self, start_grace: Duration, stop: Duration, kill: Duration) -> Self {
        self.start_grace = start_grace;
        self.stop_timeout = stop;
        self.kill_timeout = kill;
        self
    }

    pub fn service_dir(&self, id: &str) -> PathBuf {
        self.services_dir.join(id)
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.service_dir(id).join("logs").join("latest.log")
    }

    /// `<service-dir>/<binary>`，Windows 上补 `.exe`
    pub fn binary_path(&self, id: &str, binary: &str) -> PathBuf {
        let mut path = self.service_dir(id).join(binary);
        if cfg!(windows) && path.extension().is_none() {
            path.set_extension("exe");
        }
        path
    }

    /// 当前进程表快照。
    pub async fn handles(&self) -> Vec<ProcessHandle> {
        self.handles.lock().await.values().cloned().collect()
    }

    /// 存活判断：等待任务未报告退出，且操作系统中进程存在且不是僵尸。
    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        !handle.has_exited() && self.pid_alive(handle.pid)
    }

    fn pid_alive(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from(pid as usize);
        if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            return false;
        }
        sys.process(pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    /// 仅当表中仍是同一个 pid 时删除，避免误删新启动的实例。
    async fn remove_if(handles: &Mutex<HashMap<String, ProcessHandle>>, name: &str, pid: u32) {
        let mut guard = handles.lock().await;
        if guard.get(name).map(|h| h.pid) == Some(pid) {
            guard.remove(name);
        }
    }

    fn resolve_working_dir(&self, id: &str, spec: &LaunchSpec) -> Result<PathBuf> {
        let service_dir = self.service_dir(id);
        match spec.working_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => {
                let dir = Path::new(dir);
                let dir = if dir.is_absolute() {
                    dir.to_path_buf()
                } else {
                    service_dir.join(dir)
                };
                if !dir.exists() {
                    return Err(ServiceError::start_failed(
                        id,
                        format!("working directory not found: {}", dir.display()),
                    ));
                }
                Ok(dir)
            }
            None => Ok(service_dir),
        }
    }

    /// 等待进程退出，超时返回 false。
    async fn wait_exit(&self, handle: &ProcessHandle, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive(handle) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// 发送优雅终止信号。
    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from(pid as usize);
        sys.refresh_process_specifics(pid, ProcessRefreshKind::new());
        sys.process(pid)
            .and_then(|p| p.kill_with(sysinfo::Signal::Term))
            .unwrap_or(false)
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> bool {
        // 不带 /F 的 taskkill 请求进程树自行关闭
        std::process::Command::new("taskkill")
            .args(["/T", "/PID", &pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// 强制杀死整个进程树，从叶子节点向上。
    fn kill_tree(&self, pid: u32) -> bool {
        let Ok(mut sys) = self.system.lock() else {
            return false;
        };
        sys.refresh_processes();

        let mut tree = Vec::new();
        collect_process_tree(&sys, Pid::from(pid as usize), &mut tree);
        if tree.is_empty() {
            return true;
        }
        tree.reverse();

        let mut all_killed = true;
        for tree_pid in tree {
            if let Some(process) = sys.process(tree_pid) {
                if !process.kill() {
                    all_killed = false;
                }
            }
        }
        all_killed
    }
}

/// 启动占位：析构时释放 id，失败路径与被取消的启动都会归还。
struct StartReservation {
    starting: Arc<StdMutex<HashSet<String>>>,
    name: String,
}

impl Drop for StartReservation {
    fn drop(&mut self) {
        if let Ok(mut set) = self.starting.lock() {
            set.remove(&self.name);
        }
    }
}

/// 递归收集进程树中的所有进程 ID
fn collect_process_tree(sys: &System, pid: Pid, result: &mut Vec<Pid>) {
    if sys.process(pid).is_some() {
        result.push(pid);
    }
    for (child_pid, process) in sys.processes() {
        if process.parent() == Some(pid) && !result.contains(child_pid) {
            collect_process_tree(sys, *child_pid, result);
        }
    }
}

/// Unix 上首次运行前补齐可执行位。
#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Backend for ProcessBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Process
    }

    async fn ensure_available(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.services_dir).await.map_err(|e| {
            ServiceError::BackendUnavailable(format!(
                "services directory {} is not writable: {e}",
                self.services_dir.display()
            ))
        })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceStatus> {
        let name = spec.name.as_str();
        validate_name(name)?;

        // 拒绝重复启动；失效条目直接清理。检查与占位在同一把锁内完成
        let _reservation = {
            let mut guard = self.handles.lock().await;
            if let Some(existing) = guard.get(name) {
                if self.is_alive(existing) {
                    return Err(ServiceError::AlreadyRunning(name.to_string()));
                }
                guard.remove(name);
            }
            let mut starting = self
                .starting
                .lock()
                .map_err(|e| ServiceError::Other(e.to_string()))?;
            if !starting.insert(name.to_string()) {
                return Err(ServiceError::AlreadyRunning(name.to_string()));
            }
            StartReservation {
                starting: self.starting.clone(),
                name: name.to_string(),
            }
        };

        let binary = self.binary_path(name, &spec.target);
        if spec.target.trim().is_empty() || !binary.is_file() {
            return Err(ServiceError::BinaryMissing {
                service: spec.service_id.clone(),
                path: binary.display().to_string(),
            });
        }
        ensure_executable(&binary)?;
        let cwd = self.resolve_working_dir(name, spec)?;

        let mut cmd = tokio::process::Command::new(&binary);
        cmd.args(&spec.command)
            .current_dir(&cwd)
            .envs(spec.env.iter().map(|e| (e.name.as_str(), e.value.as_str())))
            .stdin(Stdio::null());

        let log_path = self.log_path(name);
        let redirect = spec.output == OutputPolicy::Log;
        if redirect {
            if let Some(dir) = log_path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            // 启动时清空日志文件
            tokio::fs::write(&log_path, "").await?;
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::start_failed(&spec.service_id, e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| ServiceError::start_failed(&spec.service_id, "missing pid"))?;

        if redirect {
            let writer = Arc::new(Mutex::new(open_append(&log_path).await));
            if let Some(stdout) = child.stdout.take() {
                spawn_output_forward(stdout, writer.clone(), log_path.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_output_forward(stderr, writer, log_path.clone());
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            service_id: spec.service_id.clone(),
            pid,
            started_at: Utc::now(),
            exit: exit_rx,
        };
        // 等待任务：回收子进程，记录退出，从进程表删除
        {
            let handles = self.handles.clone();
            let name = name.to_string();
            let log_path = log_path.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => {
                        if redirect {
                            append_note(&log_path, &format!("process exited: {status}"));
                        }
                        status.code()
                    }
                    Err(e) => {
                        warn!(service_id = %name, error = %e, "failed to wait for process");
                        None
                    }
                };
                let _ = exit_tx.send(Some(code));
                Self::remove_if(&handles, &name, pid).await;
                info!(service_id = %name, pid, ?code, "process exited");
            });
        }

        // 窗口内退出视为启动失败；通过后才进入进程表
        tokio::time::sleep(self.start_grace).await;
        let confirmed = {
            let mut guard = self.handles.lock().await;
            let alive = !handle.has_exited() && self.pid_alive(pid);
            if alive {
                guard.insert(name.to_string(), handle.clone());
            }
            alive
        };
        if !confirmed {
            let code = handle.exit.borrow().clone().flatten();
            let recent = tail_lines(&log_path, 10).unwrap_or_default().join("\n");
            return Err(ServiceError::start_failed(
                &spec.service_id,
                format!("process exited immediately (code {code:?})\n{recent}")
                    .trim_end()
                    .to_string(),
            ));
        }

        info!(service_id = %spec.service_id, pid, "process started");
        Ok(ServiceStatus {
            state: ServiceState::Running,
            pid: Some(pid),
            uptime_ms: Some(0),
        })
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<StopOutcome> {
        validate_name(name)?;
        let handle = self.handles.lock().await.get(name).cloned();
        let Some(handle) = handle else {
            return Ok(StopOutcome::AlreadyStopped);
        };
        if !self.is_alive(&handle) {
            Self::remove_if(&self.handles, name, handle.pid).await;
            return Ok(StopOutcome::AlreadyStopped);
        }

        let signalled = self.terminate(handle.pid);
        let graceful = signalled && self.wait_exit(&handle, self.stop_timeout).await;
        let result = if graceful {
            Ok(StopOutcome::Stopped)
        } else {
            warn!(service_id = %name, pid = handle.pid, "graceful stop timed out; killing process tree");
            self.kill_tree(handle.pid);
            if self.wait_exit(&handle, self.kill_timeout).await {
                Ok(StopOutcome::Stopped)
            } else {
                Err(ServiceError::StopTimeout(name.to_string()))
            }
        };

        // 无论走哪条路径都删除条目
        Self::remove_if(&self.handles, name, handle.pid).await;
        result
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        validate_name(name)?;
        let mut guard = self.handles.lock().await;
        if let Some(handle) = guard.get(name) {
            if self.is_alive(handle) {
                let uptime = Utc::now()
                    .signed_duration_since(handle.started_at)
                    .num_milliseconds()
                    .max(0) as u64;
                return Ok(ServiceStatus {
                    state: ServiceState::Running,
                    pid: Some(handle.pid),
                    uptime_ms: Some(uptime),
                });
            }
            guard.remove(name);
        }
        drop(guard);

        if self.service_dir(name).exists() {
            Ok(ServiceStatus::of(ServiceState::Stopped))
        } else {
            Ok(ServiceStatus::of(ServiceState::NotFound))
        }
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        validate_name(name)?;
        let path = self.log_path(name);
        let lines = tokio::task::spawn_blocking(move || tail_lines(&path, tail))
            .await
            .map_err(|e| ServiceError::Other(e.to_string()))??;
        Ok(lines.join("\n"))
    }

    #[instrument(skip(self, command))]
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput> {
        validate_name(name)?;
        let tokens = shell_words::split(command)
            .map_err(|e| ServiceError::Template(format!("cannot parse command: {e}")))?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(ServiceError::Template("empty command".into()));
        };

        // 优先使用服务目录中的同名可执行文件，否则走 PATH
        let local = self.binary_path(name, program);
        let program = if !program.contains(['/', '\\']) && local.is_file() {
            ensure_executable(&local)?;
            local
        } else {
            PathBuf::from(program)
        };

        let child = tokio::process::Command::new(&program)
            .args(args)
            .current_dir(self.service_dir(name))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let out = tokio::time::timeout(EXEC_TIMEOUT, child)
            .await
            .map_err(|_| {
                ServiceError::Other(format!(
                    "{} timed out after {}s",
                    program.display(),
                    EXEC_TIMEOUT.as_secs()
                ))
            })??;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            output,
        })
    }
}
