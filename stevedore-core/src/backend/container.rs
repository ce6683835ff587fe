//! 容器后端：通过容器引擎 CLI（docker / podman）管理实例。
//!
//! start 总是先停止并删除同名实例再重新创建，保证配置修改在下次启动时生效。

use super::runner::{CommandOutput, CommandRunner, TokioCommandRunner};
use super::{validate_name, Backend, LaunchSpec, VolumeBinding};
use crate::document::ExecutionMode;
use crate::error::{Result, ServiceError};
use crate::models::{ExecOutput, ServiceState, ServiceStatus, StopOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 创建 / 停止后的稳定等待时间
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// `stop -t` 传给引擎的优雅停止秒数
const STOP_GRACE_SECS: u32 = 10;

#[derive(Clone)]
pub struct ContainerBackend {
    engine: String,
    runner: Arc<dyn CommandRunner>,
    settle: Duration,
}

impl std::fmt::Debug for ContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBackend")
            .field("engine", &self.engine)
            .field("settle", &self.settle)
            .finish_non_exhaustive()
    }
}

impl ContainerBackend {
    pub fn new(engine: impl Into<String>) -> Self {
        Self::with_runner(engine, Arc::new(TokioCommandRunner::default()))
    }

    pub fn with_runner(engine: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            engine: engine.into(),
            runner,
            settle: SETTLE_DELAY,
        }
    }

    /// 调整稳定等待时间（测试中设为 0）。
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn engine(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(&self.engine, &args).await
    }

    /// 组装 `run` 参数；敏感环境变量只在返回的第二个列表（日志用）中被遮蔽。
    fn run_args(spec: &LaunchSpec) -> (Vec<String>, Vec<String>) {
        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), spec.name.clone()];
        if let Some(network) = spec.network.as_deref() {
            args.push("--network".into());
            args.push(network.to_string());
        }
        if let Some(policy) = spec.restart_policy.as_deref().filter(|p| !p.is_empty()) {
            args.push("--restart".into());
            args.push(policy.to_string());
        }
        if let Some(rotation) = spec.log_rotation.as_ref() {
            if let Some(size) = rotation.max_size.as_deref() {
                args.push("--log-opt".into());
                args.push(format!("max-size={size}"));
            }
            if let Some(files) = rotation.max_files {
                args.push("--log-opt".into());
                args.push(format!("max-file={files}"));
            }
        }
        if let Some(dir) = spec.working_dir.as_deref().filter(|d| !d.is_empty()) {
            args.push("-w".into());
            args.push(dir.to_string());
        }
        if spec.gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }

        let mut masked = args.clone();
        for env in &spec.env {
            args.push("-e".into());
            args.push(env.to_arg());
            masked.push("-e".into());
            masked.push(env.masked());
        }

        let mut tail = Vec::new();
        for volume in &spec.volumes {
            tail.push("-v".to_string());
            tail.push(volume.to_arg());
        }
        for port in &spec.ports {
            tail.push("-p".to_string());
            tail.push(port.to_arg());
        }
        tail.push(spec.target.clone());
        tail.extend(spec.command.iter().cloned());

        args.extend(tail.iter().cloned());
        masked.extend(tail);
        (args, masked)
    }

    /// 首次启动前创建宿主目录；单文件挂载只创建父目录，命名卷跳过。
    fn prepare_volumes(volumes: &[VolumeBinding]) -> Result<()> {
        for volume in volumes {
            let host = Path::new(&volume.host);
            if !host.is_absolute() {
                continue;
            }
            if volume.is_file {
                if let Some(parent) = host.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            } else if !host.exists() {
                std::fs::create_dir_all(host)?;
            }
        }
        Ok(())
    }

    /// 共享网络不存在时创建；失败只告警，交给 run 报错。
    async fn ensure_network(&self, network: &str) {
        match self.engine(&["network", "inspect", network]).await {
            Ok(out) if out.success() => {}
            _ => {
                info!(network, "creating container network");
                match self.engine(&["network", "create", network]).await {
                    Ok(out) if out.success() => {}
                    Ok(out) => warn!(network, stderr = %out.stderr.trim(), "network create failed"),
                    Err(e) => warn!(network, error = %e, "network create failed"),
                }
            }
        }
    }
}

/// 解析 `inspect --format '{{.State.Status}}|{{.State.Pid}}|{{.State.StartedAt}}'`
fn parse_inspect(stdout: &str) -> ServiceStatus {
    let line = stdout.lines().next().unwrap_or("").trim().trim_matches('\'');
    let mut parts = line.split('|');
    let state = match parts.next().unwrap_or("").trim() {
        "running" | "restarting" => ServiceState::Running,
        "created" | "exited" | "paused" | "dead" | "removing" => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    };
    if state != ServiceState::Running {
        return ServiceStatus::of(state);
    }
    let pid = parts
        .next()
        .and_then(|p| p.trim().parse::<u32>().ok())
        .filter(|p| *p > 0);
    let uptime_ms = parts
        .next()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|started| {
            Utc::now()
                .signed_duration_since(started.with_timezone(&Utc))
                .num_milliseconds()
                .max(0) as u64
        });
    ServiceStatus {
        state,
        pid,
        uptime_ms,
    }
}

fn is_missing(out: &CommandOutput) -> bool {
    let err = out.stderr.to_ascii_lowercase();
    err.contains("no such") || err.contains("not found")
}

#[async_trait]
impl Backend for ContainerBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Container
    }

    #[instrument(skip(self))]
    async fn ensure_available(&self) -> Result<()> {
        match self
            .engine(&["version", "--format", "{{.Server.Version}}"])
            .await
        {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(ServiceError::BackendUnavailable(format!(
                "{} is not reachable: {}",
                self.engine,
                out.stderr.trim()
            ))),
            Err(e) => Err(ServiceError::BackendUnavailable(format!(
                "{} could not be executed: {e}",
                self.engine
            ))),
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceStatus> {
        validate_name(&spec.name)?;
        if let Some(network) = spec.network.as_deref() {
            validate_name(network)?;
        }
        Self::prepare_volumes(&spec.volumes)?;
        if let Some(network) = spec.network.as_deref() {
            self.ensure_network(network).await;
        }

        // 幂等重建：无论之前状态如何都先停止并删除
        let _ = self.engine(&["stop", &spec.name]).await;
        let _ = self.engine(&["rm", "-f", &spec.name]).await;

        let (args, masked) = Self::run_args(spec);
        debug!(engine = %self.engine, args = ?masked, "creating container");
        let out = self.runner.run(&self.engine, &args).await?;
        if !out.success() {
            return Err(ServiceError::start_failed(
                &spec.service_id,
                format!("{} run failed: {}", self.engine, out.stderr.trim()),
            ));
        }

        tokio::time::sleep(self.settle).await;
        let status = self.status(&spec.name).await?;
        if !status.is_running() {
            let recent = self.logs(&spec.name, 20).await.unwrap_or_default();
            return Err(ServiceError::start_failed(
                &spec.service_id,
                format!(
                    "container is {} after creation\n{}",
                    status.state.as_str(),
                    recent.trim_end()
                ),
            ));
        }
        info!(name = %spec.name, "container started");
        Ok(status)
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<StopOutcome> {
        validate_name(name)?;
        // 只有容器不存在时跳过；暂停、已退出或状态未知都照常下发 stop
        let current = self.status(name).await?;
        if current.state == ServiceState::NotFound {
            return Ok(StopOutcome::AlreadyStopped);
        }
        let grace = STOP_GRACE_SECS.to_string();
        let out = self.engine(&["stop", "-t", &grace, name]).await?;
        tokio::time::sleep(self.settle).await;
        if !out.success() {
            warn!(name, stderr = %out.stderr.trim(), "stop returned non-zero; container may not have been running");
            return Ok(StopOutcome::AlreadyStopped);
        }
        if current.state == ServiceState::Stopped {
            return Ok(StopOutcome::AlreadyStopped);
        }
        Ok(StopOutcome::Stopped)
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        validate_name(name)?;
        let out = self
            .engine(&[
                "inspect",
                "--format",
                "{{.State.Status}}|{{.State.Pid}}|{{.State.StartedAt}}",
                name,
            ])
            .await?;
        if out.success() {
            return Ok(parse_inspect(&out.stdout));
        }
        if is_missing(&out) {
            return Ok(ServiceStatus::of(ServiceState::NotFound));
        }
        debug!(name, stderr = %out.stderr.trim(), "inspect failed");
        Ok(ServiceStatus::of(ServiceState::Unknown))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        validate_name(name)?;
        let tail = tail.to_string();
        let out = self.engine(&["logs", "--tail", &tail, name]).await?;
        if !out.success() {
            if is_missing(&out) {
                return Err(ServiceError::NotFound(name.to_string()));
            }
            return Err(ServiceError::Other(out.stderr.trim().to_string()));
        }
        Ok(out.combined())
    }

    #[instrument(skip(self, command))]
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput> {
        validate_name(name)?;
        let tokens = shell_words::split(command)
            .map_err(|e| ServiceError::Template(format!("cannot parse command: {e}")))?;
        if tokens.is_empty() {
            return Err(ServiceError::Template("empty command".into()));
        }
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(tokens);
        let out = self.runner.run(&self.engine, &args).await?;
        Ok(ExecOutput {
            exit_code: out.code.unwrap_or(-1),
            output: out.combined(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EnvBinding, PortBinding};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 记录调用并按顺序返回预设结果；队列为空时返回成功。
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        replies: Mutex<VecDeque<(String, CommandOutput)>>,
    }

    impl FakeRunner {
        /// 当参数首个 token 为 `verb` 时返回该结果（只匹配一次）。
        fn reply(&self, verb: &str, code: i32, stdout: &str, stderr: &str) {
            self.replies.lock().unwrap().push_back((
                verb.to_string(),
                CommandOutput {
                    code: Some(code),
                    stdout: stdout.into(),
                    stderr: stderr.into(),
                },
            ));
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            let mut replies = self.replies.lock().unwrap();
            let verb = args.first().cloned().unwrap_or_default();
            if let Some(idx) = replies.iter().position(|(v, _)| *v == verb) {
                return Ok(replies.remove(idx).map(|(_, out)| out).unwrap_or_default());
            }
            Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            })
        }
    }

    fn backend(runner: Arc<FakeRunner>) -> ContainerBackend {
        ContainerBackend::with_runner("docker", runner).with_settle_delay(Duration::ZERO)
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            service_id: "node".into(),
            name: "stevedore-node".into(),
            target: "ghcr.io/pocx/node:v1".into(),
            env: vec![EnvBinding {
                name: "RPC_PASS".into(),
                value: "pw".into(),
                sensitive: true,
            }],
            ports: vec![PortBinding {
                host: 18332,
                container: 8332,
                protocol: None,
            }],
            command: vec!["bitcoind".into(), "-server".into()],
            network: Some("stevedore".into()),
            gpu: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_recreates_and_checks_running() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 0, "running|42|2024-01-01T00:00:00Z\n", "");
        let backend = backend(runner.clone());

        let status = backend.start(&spec()).await.unwrap();
        assert!(status.is_running());
        assert_eq!(status.pid, Some(42));

        let calls = runner.calls();
        let verbs: Vec<&str> = calls.iter().map(|c| c[0].as_str()).collect();
        assert_eq!(verbs, vec!["network", "stop", "rm", "run", "inspect"]);
        let run = &calls[3];
        assert_eq!(
            run,
            &vec![
                "run", "-d", "--name", "stevedore-node", "--network", "stevedore", "--gpus",
                "all", "-e", "RPC_PASS=pw", "-p", "18332:8332", "ghcr.io/pocx/node:v1",
                "bitcoind", "-server",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn start_fails_when_not_running_after_create() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 0, "exited|0|", "");
        let err = backend(runner).start(&spec()).await.unwrap_err();
        assert!(matches!(err, ServiceError::StartFailed { .. }));
    }

    #[tokio::test]
    async fn start_fails_on_run_error() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("run", 125, "", "pull access denied");
        let err = backend(runner).start(&spec()).await.unwrap_err();
        assert!(err.to_string().contains("pull access denied"));
    }

    #[tokio::test]
    async fn stop_twice_is_already_stopped() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 1, "", "Error: No such object: stevedore-node");
        runner.reply("inspect", 0, "exited|0|", "");
        let backend = backend(runner.clone());
        assert_eq!(backend.stop("stevedore-node").await.unwrap(), StopOutcome::AlreadyStopped);
        assert_eq!(backend.stop("stevedore-node").await.unwrap(), StopOutcome::AlreadyStopped);
        // 不存在的容器不下发 stop，已退出的照常下发
        let stops = runner.calls().iter().filter(|c| c[0] == "stop").count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn paused_container_is_still_stopped() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 0, "paused|7|", "");
        let backend = backend(runner.clone());
        backend.stop("stevedore-node").await.unwrap();
        let stop = runner.calls().into_iter().find(|c| c[0] == "stop").unwrap();
        assert_eq!(stop.join(" "), format!("stop -t {STOP_GRACE_SECS} stevedore-node"));
    }

    #[tokio::test]
    async fn unknown_state_still_issues_stop() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 1, "", "Cannot connect to the Docker daemon");
        runner.reply("stop", 1, "", "Error response from daemon: timeout");
        let backend = backend(runner.clone());
        // 非零退出降级为告警
        assert_eq!(backend.stop("stevedore-node").await.unwrap(), StopOutcome::AlreadyStopped);
        assert!(runner.calls().iter().any(|c| c[0] == "stop"));
    }

    #[tokio::test]
    async fn stop_running_container() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 0, "running|7|", "");
        let backend = backend(runner.clone());
        assert_eq!(backend.stop("stevedore-node").await.unwrap(), StopOutcome::Stopped);
        assert!(runner.calls().iter().any(|c| c[0] == "stop"));
    }

    #[tokio::test]
    async fn rejects_injection_in_names() {
        let runner = Arc::new(FakeRunner::default());
        let backend = backend(runner.clone());
        let err = backend.stop("node; rm -rf /").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidName(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn status_maps_missing_container() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("inspect", 1, "", "Error: No such object: x");
        let status = backend(runner).status("x").await.unwrap();
        assert_eq!(status.state, ServiceState::NotFound);
    }

    #[tokio::test]
    async fn exec_splits_command_and_reports_exit_code() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("exec", 3, "out\n", "err\n");
        let backend = backend(runner.clone());
        let result = backend
            .exec("stevedore-node", "bitcoin-cli -named getinfo \"a b\"")
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "out\nerr\n");
        let call = runner.calls().pop().unwrap();
        assert_eq!(call, vec!["exec", "stevedore-node", "bitcoin-cli", "-named", "getinfo", "a b"]);
    }

    #[tokio::test]
    async fn unavailable_engine_is_reported() {
        let runner = Arc::new(FakeRunner::default());
        runner.reply("version", 1, "", "Cannot connect to the Docker daemon");
        let err = backend(runner).ensure_available().await.unwrap_err();
        assert!(matches!(err, ServiceError::BackendUnavailable(_)));
    }

    #[test]
    fn masked_args_hide_sensitive_env() {
        let (args, masked) = ContainerBackend::run_args(&spec());
        assert!(args.contains(&"RPC_PASS=pw".to_string()));
        assert!(masked.contains(&"RPC_PASS=***".to_string()));
        assert!(!masked.contains(&"RPC_PASS=pw".to_string()));
    }
}
