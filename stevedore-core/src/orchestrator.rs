//! 编排门面：按执行模式选择后端，把注册表、命令合成、版本发现与命令模板串起来。

use crate::backend::{Backend, ContainerBackend, LaunchSpec, ProcessBackend};
use crate::discovery::{GithubClient, VersionCandidate, VersionDiscovery};
use crate::document::{
    ExecutionMode, GlobalDefaults, ImageVersion, InputKind, ReleaseVersion, ServiceDefinition,
};
use crate::error::{Result, ServiceError};
use crate::models::{ExecOutput, ServiceState, ServiceStatus, ServiceSummary, StopOutcome};
use crate::registry::ServiceRegistry;
use crate::synth;
use crate::template::MacroRegistry;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, instrument, warn};

/// 服务文档文件名：<data_dir>/services.json
pub const DOCUMENT_FILE: &str = "services.json";

pub struct Orchestrator {
    data_dir: PathBuf,
    registry: Mutex<ServiceRegistry>,
    container: Arc<dyn Backend>,
    process: Arc<dyn Backend>,
    discovery: Arc<VersionDiscovery>,
    macros: MacroRegistry,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_dir", &self.data_dir)
            .field("macros", &self.macros)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// 打开数据目录：加载文档，按全局默认值构造两种后端。
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let registry = ServiceRegistry::open(data_dir.join(DOCUMENT_FILE)).await;
        let engine = registry.defaults().engine().to_string();
        let discovery = VersionDiscovery::new(GithubClient::new()?);
        Ok(Self {
            container: Arc::new(ContainerBackend::new(engine)),
            process: Arc::new(ProcessBackend::new(data_dir.join("services"))),
            discovery: Arc::new(discovery),
            macros: MacroRegistry::with_builtins(),
            registry: Mutex::new(registry),
            data_dir,
        })
    }

    /// 由外部组装（嵌入与测试）。
    pub fn from_parts<P: AsRef<Path>>(
        data_dir: P,
        registry: ServiceRegistry,
        container: Arc<dyn Backend>,
        process: Arc<dyn Backend>,
        discovery: VersionDiscovery,
    ) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            registry: Mutex::new(registry),
            container,
            process,
            discovery: Arc::new(discovery),
            macros: MacroRegistry::with_builtins(),
        }
    }

    pub fn with_container_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.container = backend;
        self
    }

    pub fn with_process_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.process = backend;
        self
    }

    pub fn with_discovery(mut self, discovery: VersionDiscovery) -> Self {
        self.discovery = Arc::new(discovery);
        self
    }

    pub fn with_macros(mut self, macros: MacroRegistry) -> Self {
        self.macros = macros;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// 单个服务目录：<data_dir>/services/<id>
    pub fn service_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join("services").join(id)
    }

    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    /// 直接访问注册表（编辑覆盖值等）。持有期间其它操作会等待。
    pub async fn registry(&self) -> MutexGuard<'_, ServiceRegistry> {
        self.registry.lock().await
    }

    fn backend_for(&self, mode: ExecutionMode) -> &Arc<dyn Backend> {
        match mode {
            ExecutionMode::Container => &self.container,
            ExecutionMode::Process => &self.process,
        }
    }

    /// 读出服务定义与全局默认值的快照，之后不再持有锁。
    async fn snapshot(&self, id: &str) -> Result<(ServiceDefinition, GlobalDefaults)> {
        let registry = self.registry.lock().await;
        let service = registry.service(id)?.clone();
        Ok((service, registry.defaults().clone()))
    }

    pub async fn service(&self, id: &str) -> Result<ServiceDefinition> {
        Ok(self.snapshot(id).await?.0)
    }

    /// 相对宿主路径以数据目录为基准；不含路径分隔符的视为命名卷，原样传递。
    fn absolutize_volume(&self, host: &str) -> String {
        let path = Path::new(host);
        let is_named_volume = !host.contains(['/', '\\']) && !host.starts_with('.');
        if path.is_absolute() || is_named_volume {
            return host.to_string();
        }
        let relative = host.strip_prefix("./").unwrap_or(host);
        self.data_dir.join(relative).display().to_string()
    }

    /// 为当前执行模式构造启动描述。
    pub fn launch_spec(&self, service: &ServiceDefinition, defaults: &GlobalDefaults) -> Result<LaunchSpec> {
        let missing = synth::missing_required(service);
        if !missing.is_empty() {
            return Err(ServiceError::Validation(format!(
                "{}: required parameters without a value: {}",
                service.id,
                missing.join(", ")
            )));
        }

        let env = synth::environment(service);
        match service.execution_mode {
            ExecutionMode::Container => {
                let image = service.image().ok_or_else(|| {
                    ServiceError::Configuration(format!("{} declares no container image", service.id))
                })?;
                let container = service.container_spec.clone().unwrap_or_default();
                let mut volumes = synth::volume_bindings(service);
                for volume in &mut volumes {
                    volume.host = self.absolutize_volume(&volume.host);
                }
                Ok(LaunchSpec {
                    service_id: service.id.clone(),
                    name: service.container_name(defaults),
                    target: image.reference(),
                    env,
                    volumes,
                    ports: synth::port_bindings(service),
                    command: synth::synthesize_command(service),
                    network: Some(service.network(defaults)),
                    working_dir: container.working_dir,
                    gpu: container.gpu,
                    restart_policy: Some(defaults.restart_policy().to_string()),
                    log_rotation: defaults.log_rotation.clone(),
                    output: service.output_policy(),
                })
            }
            ExecutionMode::Process => {
                let binary = service.process_binary().ok_or_else(|| {
                    ServiceError::Configuration(format!("{} declares no binary", service.id))
                })?;
                Ok(LaunchSpec {
                    service_id: service.id.clone(),
                    name: service.id.clone(),
                    target: binary.to_string(),
                    env,
                    command: synth::parameter_arguments(service),
                    working_dir: service.process_spec.as_ref().and_then(|p| p.working_dir.clone()),
                    output: service.output_policy(),
                    ..Default::default()
                })
            }
        }
    }

    /// 列出所有服务并并发查询状态；单个查询失败记为 unknown。
    pub async fn list_services(&self) -> Vec<ServiceSummary> {
        let (services, defaults) = {
            let registry = self.registry.lock().await;
            (registry.services().to_vec(), registry.defaults().clone())
        };
        let futures = services.iter().map(|service| {
            let backend = self.backend_for(service.execution_mode).clone();
            let instance = service.instance_name(&defaults);
            async move {
                let state = match backend.status(&instance).await {
                    Ok(status) => status.state,
                    Err(e) => {
                        warn!(service_id = %service.id, error = %e, "status query failed");
                        ServiceState::Unknown
                    }
                };
                ServiceSummary {
                    id: service.id.clone(),
                    name: service.name.clone(),
                    mode: service.execution_mode,
                    state,
                    instance,
                }
            }
        });
        join_all(futures).await
    }

    #[instrument(skip(self))]
    pub async fn status(&self, id: &str) -> Result<ServiceStatus> {
        let (service, defaults) = self.snapshot(id).await?;
        self.backend_for(service.execution_mode)
            .status(&service.instance_name(&defaults))
            .await
    }

    /// 启动：先探测后端可用性，再合成启动描述交给后端。
    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<ServiceStatus> {
        let (service, defaults) = self.snapshot(id).await?;
        let backend = self.backend_for(service.execution_mode);
        backend.ensure_available().await?;
        let spec = self.launch_spec(&service, &defaults)?;
        let status = backend.start(&spec).await?;
        info!(service_id = %id, mode = service.execution_mode.as_str(), "service started");
        Ok(status)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<StopOutcome> {
        let (service, defaults) = self.snapshot(id).await?;
        let outcome = self
            .backend_for(service.execution_mode)
            .stop(&service.instance_name(&defaults))
            .await?;
        if outcome == StopOutcome::AlreadyStopped {
            info!(service_id = %id, "service was not running");
        }
        Ok(outcome)
    }

    /// Restart：先停后启（停失败则报错）。
    #[instrument(skip(self))]
    pub async fn restart(&self, id: &str) -> Result<ServiceStatus> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// 并发停止所有运行中的服务（用于退出）；返回每个服务的停止结果。
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Vec<(String, Result<StopOutcome>)> {
        let running: Vec<String> = self
            .list_services()
            .await
            .into_iter()
            .filter(|s| s.state == ServiceState::Running)
            .map(|s| s.id)
            .collect();
        if running.is_empty() {
            return Vec::new();
        }
        info!("stopping {} running services...", running.len());

        let results = join_all(running.iter().map(|id| self.stop(id))).await;
        running
            .into_iter()
            .zip(results)
            .inspect(|(id, result)| {
                if let Err(e) = result {
                    warn!(service_id = %id, error = %e, "failed to stop service");
                }
            })
            .collect()
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let (service, defaults) = self.snapshot(id).await?;
        self.backend_for(service.execution_mode)
            .logs(&service.instance_name(&defaults), tail)
            .await
    }

    /// 执行自定义命令：校验输入类型 → 完整解析模板 → 在运行中的实例里执行。
    #[instrument(skip(self, inputs))]
    pub async fn run_custom_command(
        &self,
        id: &str,
        command_id: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        let (service, defaults) = self.snapshot(id).await?;
        let command = service
            .custom_command(command_id)
            .ok_or_else(|| ServiceError::NotFound(format!("{id}/{command_id}")))?;

        for input in &command.inputs {
            if let Some(value) = inputs.get(&input.name) {
                check_input_kind(&input.name, input.kind, value)?;
            }
        }
        let line = self.macros.resolve_command(command, inputs)?;

        let backend = self.backend_for(service.execution_mode);
        let instance = service.instance_name(&defaults);
        if !backend.status(&instance).await?.is_running() {
            return Err(ServiceError::NotRunning(id.to_string()));
        }
        let has_secret = command.inputs.iter().any(|i| i.kind == InputKind::Secret);
        if has_secret {
            info!(service_id = %id, command = %command_id, "executing custom command");
        } else {
            info!(service_id = %id, command = %command_id, line = %line, "executing custom command");
        }
        backend.exec(&instance, &line).await
    }

    /// 候选版本：静态列表在前，远程发现在后，按引用去重。
    #[instrument(skip(self))]
    pub async fn discover_versions(&self, id: &str) -> Result<Vec<VersionCandidate>> {
        let (service, _) = self.snapshot(id).await?;
        let source = service.source_spec.clone().unwrap_or_default();
        let mut candidates: Vec<VersionCandidate> = Vec::new();
        let mut push = |candidate: VersionCandidate| {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        };

        match service.execution_mode {
            ExecutionMode::Container => {
                let container = source.container.unwrap_or_default();
                container.versions.into_iter().map(VersionCandidate::Image).for_each(&mut push);
                if let Some(spec) = &container.discovery {
                    self.discovery
                        .discover_images(spec)
                        .await
                        .into_iter()
                        .map(VersionCandidate::Image)
                        .for_each(&mut push);
                }
                // 当前生效的镜像也列为候选
                if let Some(declared) = service.image() {
                    push(VersionCandidate::Image(declared));
                }
            }
            ExecutionMode::Process => {
                let process = source.process.unwrap_or_default();
                process.versions.into_iter().map(VersionCandidate::Release).for_each(&mut push);
                if let Some(spec) = &process.discovery {
                    self.discovery
                        .discover_releases(spec)
                        .await
                        .into_iter()
                        .map(VersionCandidate::Release)
                        .for_each(&mut push);
                }
            }
        }
        Ok(candidates)
    }

    /// 记录选中的版本为覆盖值；容器模式下次启动生效，进程模式需随后安装。
    #[instrument(skip(self))]
    pub async fn select_version(&self, id: &str, candidate: VersionCandidate) -> Result<()> {
        let mut registry = self.registry.lock().await;
        match candidate {
            VersionCandidate::Image(image) => registry.set_image_override(id, Some(image)).await,
            VersionCandidate::Release(release) => registry.set_release_override(id, Some(release)).await,
        }
    }

    /// 清除当前模式的版本覆盖，回到声明的默认版本。
    pub async fn reset_version(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        match registry.service(id)?.execution_mode {
            ExecutionMode::Container => registry.set_image_override(id, None::<ImageVersion>).await,
            ExecutionMode::Process => registry.set_release_override(id, None::<ReleaseVersion>).await,
        }
    }

    /// 下载并安装发布包到服务目录，成功后记录为当前版本。运行中的服务拒绝安装。
    #[instrument(skip(self, release))]
    pub async fn install_release(&self, id: &str, release: Option<ReleaseVersion>) -> Result<PathBuf> {
        let (service, _) = self.snapshot(id).await?;
        let binary = service
            .process_binary()
            .ok_or_else(|| ServiceError::Configuration(format!("{id} declares no binary")))?
            .to_string();
        let release = release
            .or_else(|| service.release())
            .ok_or_else(|| ServiceError::Configuration(format!("{id} has no release to install")))?;

        if self.process.status(id).await?.is_running() {
            return Err(ServiceError::AlreadyRunning(id.to_string()));
        }

        let path = self
            .discovery
            .install(&release, &self.service_dir(id), &binary)
            .await?;
        self.registry
            .lock()
            .await
            .set_release_override(id, Some(release))
            .await?;
        Ok(path)
    }

    /// 设置参数值（文本输入，按声明类型解析校验）。
    pub async fn set_parameter(&self, id: &str, name: &str, raw: &str) -> Result<()> {
        self.registry.lock().await.set_parameter_raw(id, name, raw).await
    }

    pub async fn reset_parameter(&self, id: &str, name: &str) -> Result<()> {
        self.registry.lock().await.reset_parameter(id, name).await
    }

    /// 切换执行模式；运行中的服务拒绝切换，需先停止。
    #[instrument(skip(self))]
    pub async fn set_execution_mode(&self, id: &str, mode: ExecutionMode) -> Result<()> {
        let (service, _) = self.snapshot(id).await?;
        if service.execution_mode == mode {
            return Ok(());
        }
        if self.status(id).await?.is_running() {
            return Err(ServiceError::AlreadyRunning(id.to_string()));
        }
        self.registry.lock().await.set_execution_mode(id, mode).await
    }
}

/// 自定义命令输入的类型检查。
fn check_input_kind(name: &str, kind: InputKind, value: &str) -> Result<()> {
    let ok = match kind {
        InputKind::Text | InputKind::Secret => true,
        InputKind::Int => value.trim().parse::<i64>().is_ok(),
        InputKind::Bool => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "false" | "yes" | "no" | "1" | "0"
        ),
    };
    if ok {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "input {name} expects {kind:?}, got {value:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContainerSpec, ProcessSpec, ServiceDocument, VolumeMapping};

    fn orchestrator(dir: &Path, services: Vec<ServiceDefinition>) -> Orchestrator {
        let document = ServiceDocument {
            services,
            ..Default::default()
        };
        let registry = ServiceRegistry::with_document(dir.join(DOCUMENT_FILE), document);
        let github = GithubClient::new().unwrap().with_api_base("http://127.0.0.1:9");
        Orchestrator::from_parts(
            dir,
            registry,
            Arc::new(ContainerBackend::new("docker")),
            Arc::new(ProcessBackend::new(dir.join("services"))),
            VersionDiscovery::new(github),
        )
    }

    fn node() -> ServiceDefinition {
        let mut svc = ServiceDefinition::new("node", "Node");
        svc.container_spec = Some(ContainerSpec {
            image: "pocx-node".into(),
            binary: Some("bitcoind".into()),
            ..Default::default()
        });
        svc.process_spec = Some(ProcessSpec {
            binary: Some("bitcoind".into()),
            ..Default::default()
        });
        svc
    }

    #[test]
    fn container_launch_spec_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut svc = node();
        svc.volumes = vec![
            VolumeMapping::new("/data", "./data/node"),
            VolumeMapping::new("/cache", "node-cache"),
            VolumeMapping::new("/abs", "/srv/abs"),
        ];
        let orch = orchestrator(dir.path(), vec![svc.clone()]);
        let spec = orch.launch_spec(&svc, &GlobalDefaults::default()).unwrap();

        assert_eq!(spec.name, "stevedore-node");
        assert_eq!(spec.target, "pocx-node:latest");
        assert_eq!(spec.network.as_deref(), Some("stevedore"));
        assert_eq!(spec.restart_policy.as_deref(), Some("unless-stopped"));
        assert_eq!(spec.command, vec!["bitcoind"]);
        assert_eq!(
            spec.volumes[0].host,
            dir.path().join("data/node").display().to_string()
        );
        assert_eq!(spec.volumes[1].host, "node-cache");
        assert_eq!(spec.volumes[2].host, "/srv/abs");
    }

    #[test]
    fn process_launch_spec_has_no_binary_in_args() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut svc = node();
        svc.execution_mode = ExecutionMode::Process;
        let orch = orchestrator(dir.path(), vec![svc.clone()]);
        let spec = orch.launch_spec(&svc, &GlobalDefaults::default()).unwrap();
        assert_eq!(spec.name, "node");
        assert_eq!(spec.target, "bitcoind");
        assert!(spec.command.is_empty());
        assert!(spec.network.is_none());
    }

    #[test]
    fn input_kinds() {
        assert!(check_input_kind("n", InputKind::Int, "42").is_ok());
        assert!(check_input_kind("n", InputKind::Int, "4x").is_err());
        assert!(check_input_kind("b", InputKind::Bool, "Yes").is_ok());
        assert!(check_input_kind("b", InputKind::Bool, "maybe").is_err());
        assert!(check_input_kind("s", InputKind::Secret, "").is_ok());
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), vec![node()]);
        assert!(matches!(orch.status("ghost").await, Err(ServiceError::NotFound(_))));
        assert!(matches!(orch.stop("ghost").await, Err(ServiceError::NotFound(_))));
    }
}
