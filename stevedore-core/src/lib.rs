//! Core library for service orchestration: declarative service document, command
//! synthesis, container and native-process backends, version discovery, and
//! templated commands against running services.

pub mod backend;
pub mod discovery;
pub mod document;
mod error;
mod models;
mod orchestrator;
pub mod registry;
pub mod synth;
pub mod template;

pub use backend::{Backend, ContainerBackend, LaunchSpec, ProcessBackend};
pub use discovery::{CredentialProvider, GithubClient, VersionCandidate, VersionDiscovery};
pub use document::{ExecutionMode, ServiceDefinition, ServiceDocument};
pub use error::{Result, ServiceError};
pub use models::{ExecOutput, ServiceState, ServiceStatus, ServiceSummary, StopOutcome};
pub use orchestrator::{Orchestrator, DOCUMENT_FILE};
pub use registry::ServiceRegistry;
pub use template::{MacroRegistry, WalletSource};
