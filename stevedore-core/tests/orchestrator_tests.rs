use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stevedore_core::document::{
    CommandInput, ContainerSpec, CustomCommand, InputKind, ParamKind, Parameter, ProcessSpec,
};
use stevedore_core::{
    Backend, ExecOutput, ExecutionMode, GithubClient, LaunchSpec, Orchestrator, Result,
    ServiceDefinition, ServiceDocument, ServiceError, ServiceRegistry, ServiceState,
    ServiceStatus, StopOutcome, VersionCandidate, VersionDiscovery, DOCUMENT_FILE,
};
use tempfile::TempDir;

/// In-memory backend: remembers launched specs and running instances.
struct FakeBackend {
    mode: ExecutionMode,
    available: bool,
    running: Mutex<HashMap<String, LaunchSpec>>,
    execs: Mutex<Vec<(String, String)>>,
}

impl FakeBackend {
    fn new(mode: ExecutionMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            available: true,
            running: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
        })
    }

    fn unavailable(mode: ExecutionMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            available: false,
            running: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
        })
    }

    fn launched(&self, name: &str) -> Option<LaunchSpec> {
        self.running.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(ServiceError::BackendUnavailable("engine not reachable".into()))
        }
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceStatus> {
        self.running
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(ServiceStatus::of(ServiceState::Running))
    }

    async fn stop(&self, name: &str) -> Result<StopOutcome> {
        match self.running.lock().unwrap().remove(name) {
            Some(_) => Ok(StopOutcome::Stopped),
            None => Ok(StopOutcome::AlreadyStopped),
        }
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let state = if self.running.lock().unwrap().contains_key(name) {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        };
        Ok(ServiceStatus::of(state))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        Ok(format!("{name}: last {tail} lines"))
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput> {
        self.execs
            .lock()
            .unwrap()
            .push((name.to_string(), command.to_string()));
        Ok(ExecOutput {
            exit_code: 0,
            output: "ok".into(),
        })
    }
}

fn node() -> ServiceDefinition {
    let mut svc = ServiceDefinition::new("node", "PoCX Node");
    svc.container_spec = Some(ContainerSpec {
        image: "pocx-node".into(),
        repository: Some("ghcr.io/pocx".into()),
        tag: Some("v1.0.0".into()),
        binary: Some("bitcoind".into()),
        ..Default::default()
    });
    svc.process_spec = Some(ProcessSpec {
        binary: Some("bitcoind".into()),
        ..Default::default()
    });
    let mut rpcport = Parameter::new("rpcport", "-rpcport", ParamKind::Int);
    rpcport.min = Some(1);
    rpcport.max = Some(65535);
    let server = Parameter::new("server", "-server", ParamKind::Bool);
    svc.parameters = vec![server, rpcport];
    svc.custom_commands = vec![CustomCommand {
        id: "send".into(),
        binary: "bitcoin-cli".into(),
        args: vec![
            "sendtoaddress".into(),
            "{{input:addr}}".into(),
            "{{input:amount}}".into(),
        ],
        inputs: vec![
            CommandInput {
                name: "addr".into(),
                prompt: None,
                kind: InputKind::Text,
                default: None,
                extra: Default::default(),
            },
            CommandInput {
                name: "amount".into(),
                prompt: None,
                kind: InputKind::Int,
                default: None,
                extra: Default::default(),
            },
        ],
        ..Default::default()
    }];
    svc
}

fn miner() -> ServiceDefinition {
    let mut svc = ServiceDefinition::new("miner", "Miner");
    svc.execution_mode = ExecutionMode::Process;
    svc.process_spec = Some(ProcessSpec {
        binary: Some("pocx_miner".into()),
        ..Default::default()
    });
    svc
}

struct Harness {
    dir: TempDir,
    container: Arc<FakeBackend>,
    process: Arc<FakeBackend>,
    orchestrator: Orchestrator,
}

fn harness_with(container: Arc<FakeBackend>) -> Harness {
    let dir = TempDir::new().unwrap();
    let document = ServiceDocument {
        services: vec![node(), miner()],
        ..Default::default()
    };
    let registry = ServiceRegistry::with_document(dir.path().join(DOCUMENT_FILE), document);
    let process = FakeBackend::new(ExecutionMode::Process);
    let github = GithubClient::new().unwrap().with_api_base("http://127.0.0.1:9");
    let orchestrator = Orchestrator::from_parts(
        dir.path(),
        registry,
        container.clone(),
        process.clone(),
        VersionDiscovery::new(github),
    );
    Harness {
        dir,
        container,
        process,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(FakeBackend::new(ExecutionMode::Container))
}

#[tokio::test]
async fn start_routes_by_execution_mode() {
    let h = harness();
    h.orchestrator.set_parameter("node", "server", "true").await.unwrap();
    h.orchestrator.set_parameter("node", "rpcport", "18332").await.unwrap();

    h.orchestrator.start("node").await.unwrap();
    let spec = h.container.launched("stevedore-node").unwrap();
    assert_eq!(spec.target, "ghcr.io/pocx/pocx-node:v1.0.0");
    assert_eq!(spec.command, vec!["bitcoind", "-server", "-rpcport=18332"]);

    h.orchestrator.start("miner").await.unwrap();
    assert!(h.process.launched("miner").is_some());
    assert!(h.container.launched("miner").is_none());

    let summaries = h.orchestrator.list_services().await;
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.state == ServiceState::Running));
}

#[tokio::test]
async fn stop_twice_is_not_an_error() {
    let h = harness();
    h.orchestrator.start("node").await.unwrap();
    assert_eq!(h.orchestrator.stop("node").await.unwrap(), StopOutcome::Stopped);
    assert_eq!(h.orchestrator.stop("node").await.unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(h.orchestrator.stop("node").await.unwrap(), StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn unavailable_backend_fails_before_start() {
    let h = harness_with(FakeBackend::unavailable(ExecutionMode::Container));
    let err = h.orchestrator.start("node").await.unwrap_err();
    assert!(matches!(err, ServiceError::BackendUnavailable(_)));
    assert!(h.container.launched("stevedore-node").is_none());
}

#[tokio::test]
async fn invalid_parameter_keeps_prior_value() {
    let h = harness();
    h.orchestrator.set_parameter("node", "rpcport", "8332").await.unwrap();
    let err = h.orchestrator.set_parameter("node", "rpcport", "70000").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let svc = h.orchestrator.service("node").await.unwrap();
    assert_eq!(svc.parameter("rpcport").unwrap().value.as_ref().unwrap().render(), "8332");
}

#[tokio::test]
async fn name_override_survives_reload_and_drives_instance_name() {
    let h = harness();
    h.orchestrator
        .registry()
        .await
        .set_name_override("node", Some("my-node".into()))
        .await
        .unwrap();
    h.orchestrator.start("node").await.unwrap();
    assert!(h.container.launched("my-node").is_some());

    let reopened = ServiceRegistry::open(h.dir.path().join(DOCUMENT_FILE)).await;
    let svc = reopened.service("node").unwrap();
    assert_eq!(svc.container_name(reopened.defaults()), "my-node");
}

#[tokio::test]
async fn custom_command_resolves_then_executes() {
    let h = harness();
    h.orchestrator.start("node").await.unwrap();

    let inputs: HashMap<String, String> = [("addr", "pocx1q xyz"), ("amount", "5")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let out = h
        .orchestrator
        .run_custom_command("node", "send", &inputs)
        .await
        .unwrap();
    assert!(out.success());

    let execs = h.container.execs.lock().unwrap().clone();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].0, "stevedore-node");
    assert_eq!(
        shell_words::split(&execs[0].1).unwrap(),
        vec!["bitcoin-cli", "sendtoaddress", "pocx1q xyz", "5"]
    );
}

#[tokio::test]
async fn custom_command_failures_never_execute() {
    let h = harness();
    let mut inputs = HashMap::new();
    inputs.insert("addr".to_string(), "X".to_string());

    // not running
    inputs.insert("amount".to_string(), "1".to_string());
    let err = h.orchestrator.run_custom_command("node", "send", &inputs).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotRunning(_)));

    h.orchestrator.start("node").await.unwrap();

    // wrong input kind
    inputs.insert("amount".to_string(), "lots".to_string());
    let err = h.orchestrator.run_custom_command("node", "send", &inputs).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    // missing input
    inputs.remove("amount");
    let err = h.orchestrator.run_custom_command("node", "send", &inputs).await.unwrap_err();
    assert!(matches!(err, ServiceError::Template(_)));

    assert!(h.container.execs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn selected_version_becomes_image_override() {
    let h = harness();
    let candidates = h.orchestrator.discover_versions("node").await.unwrap();
    assert!(candidates.iter().any(|c| c.label() == "ghcr.io/pocx/pocx-node:v1.0.0"));

    let chosen = VersionCandidate::Image(stevedore_core::document::ImageVersion {
        repository: Some("ghcr.io/pocx".into()),
        image: "pocx-node".into(),
        tag: "v1.1.0".into(),
    });
    h.orchestrator.select_version("node", chosen).await.unwrap();
    h.orchestrator.start("node").await.unwrap();
    let spec = h.container.launched("stevedore-node").unwrap();
    assert_eq!(spec.target, "ghcr.io/pocx/pocx-node:v1.1.0");

    h.orchestrator.reset_version("node").await.unwrap();
    assert!(h.orchestrator.service("node").await.unwrap().image_override.is_none());
}

#[tokio::test]
async fn mode_switch_refused_while_running() {
    let h = harness();
    h.orchestrator.start("node").await.unwrap();
    let err = h
        .orchestrator
        .set_execution_mode("node", ExecutionMode::Process)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyRunning(_)));

    h.orchestrator.stop("node").await.unwrap();
    h.orchestrator
        .set_execution_mode("node", ExecutionMode::Process)
        .await
        .unwrap();
    let svc = h.orchestrator.service("node").await.unwrap();
    assert_eq!(svc.execution_mode, ExecutionMode::Process);
    assert!(svc.container_spec.is_some());
}

#[tokio::test]
async fn stop_all_stops_only_running() {
    let h = harness();
    h.orchestrator.start("miner").await.unwrap();
    let results = h.orchestrator.stop_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "miner");
    assert_eq!(*results[0].1.as_ref().unwrap(), StopOutcome::Stopped);
    assert!(h.orchestrator.stop_all().await.is_empty());
}
