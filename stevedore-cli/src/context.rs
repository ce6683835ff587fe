//! Builds the orchestrator the CLI works against, plus the terminal-bound
//! collaborators the core leaves pluggable.

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Password};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stevedore_core::{
    ContainerBackend, CredentialProvider, GithubClient, MacroRegistry, Orchestrator, ServiceError,
    VersionDiscovery, WalletSource,
};
use tracing::{debug, warn};

/// `<user data dir>/stevedore`, falling back to the home directory, then `.`.
pub fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .or_else(dirs_next::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stevedore")
}

/// Wallet data supplied through the environment.
struct EnvWallet;

impl EnvWallet {
    fn read(var: &str) -> stevedore_core::Result<String> {
        std::env::var(var).map_err(|_| ServiceError::Template(format!("{var} is not set")))
    }
}

impl WalletSource for EnvWallet {
    fn address(&self) -> stevedore_core::Result<String> {
        Self::read("SD_WALLET_ADDRESS")
    }

    fn descriptor(&self) -> stevedore_core::Result<String> {
        Self::read("SD_WALLET_DESCRIPTOR")
    }

    fn public_key(&self) -> stevedore_core::Result<String> {
        Self::read("SD_WALLET_PUBKEY")
    }
}

/// Asks the operator for a token when a registry rejects the request.
struct PromptCredentials;

#[async_trait]
impl CredentialProvider for PromptCredentials {
    async fn acquire(&self, source: &str) -> Option<String> {
        if !std::io::stdin().is_terminal() {
            debug!(source, "stdin is not a terminal; not prompting for a token");
            return None;
        }
        let prompt = format!("Token for {source} (empty to skip)");
        let answer = tokio::task::spawn_blocking(move || {
            Password::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()
        })
        .await;
        match answer {
            Ok(Ok(token)) => accept_token(source, token),
            Ok(Err(e)) => {
                warn!(source, error = %e, "token prompt failed");
                None
            }
            Err(e) => {
                warn!(source, error = %e, "token prompt task failed");
                None
            }
        }
    }
}

/// An empty answer declines the prompt.
fn accept_token(source: &str, token: String) -> Option<String> {
    if token.is_empty() {
        debug!(source, "token prompt declined");
        return None;
    }
    Some(token)
}

/// Opens the data directory. `engine` overrides the document's container engine.
pub async fn build(
    data_dir: &Path,
    engine: Option<String>,
    token: Option<String>,
) -> anyhow::Result<Orchestrator> {
    let discovery = VersionDiscovery::new(GithubClient::new()?)
        .with_token(token)
        .with_credentials(Arc::new(PromptCredentials));
    let mut macros = MacroRegistry::with_builtins();
    macros.register_wallet(Arc::new(EnvWallet));

    let mut orch = Orchestrator::open(data_dir)
        .await?
        .with_discovery(discovery)
        .with_macros(macros);
    if let Some(engine) = engine {
        orch = orch.with_container_backend(Arc::new(ContainerBackend::new(engine)));
    }
    Ok(orch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_against_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), Some("podman".into()), None).await.unwrap();
        assert!(orch.list_services().await.is_empty());
        assert!(orch.macros().contains("Wallet.Address"));
        assert!(orch.macros().contains("Timestamp.Now"));
    }

    #[test]
    fn empty_token_declines() {
        assert_eq!(accept_token("ghcr.io/pocx", String::new()), None);
        assert_eq!(accept_token("ghcr.io/pocx", "ghp_x".into()), Some("ghp_x".into()));
    }

    #[test]
    fn data_dir_is_named_after_the_tool() {
        assert!(default_data_dir().ends_with("stevedore"));
    }
}
