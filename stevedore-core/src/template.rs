//! Command templates: `{{input:<name>}}` and `{{macro:<Name>(args...)}}` placeholders.
//!
//! Resolution is all-or-nothing. A missing input or unknown macro aborts before
//! anything runs, so a command is never executed half-resolved.

use crate::document::CustomCommand;
use crate::error::{Result, ServiceError};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A registered macro: arguments in, replacement text out.
pub type MacroFn = Arc<dyn Fn(&[String]) -> Result<String> + Send + Sync>;

/// Source of wallet data for the `Wallet.*` macros. Key derivation and address
/// encoding live behind this boundary.
pub trait WalletSource: Send + Sync {
    fn address(&self) -> Result<String>;
    fn descriptor(&self) -> Result<String>;
    fn public_key(&self) -> Result<String>;
}

#[derive(Clone, Default)]
pub struct MacroRegistry {
    macros: HashMap<String, MacroFn>,
}

impl fmt::Debug for MacroRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("MacroRegistry").field("macros", &names).finish()
    }
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `Timestamp.Now`, `Timestamp.NowMillis`,
    /// `Timestamp.Iso` and `Env.Var(name)`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Timestamp.Now", |_| Ok(Utc::now().timestamp().to_string()));
        registry.register("Timestamp.NowMillis", |_| {
            Ok(Utc::now().timestamp_millis().to_string())
        });
        registry.register("Timestamp.Iso", |_| {
            Ok(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        });
        registry.register("Env.Var", |args| {
            let name = args
                .first()
                .ok_or_else(|| ServiceError::Template("Env.Var requires a variable name".into()))?;
            std::env::var(name)
                .map_err(|_| ServiceError::Template(format!("environment variable {name} is not set")))
        });
        registry
    }

    /// Adds or replaces a macro.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[String]) -> Result<String> + Send + Sync + 'static,
    {
        self.macros.insert(name.into(), Arc::new(f));
    }

    /// Registers `Wallet.Address`, `Wallet.Descriptor` and `Wallet.PublicKey`.
    pub fn register_wallet(&mut self, wallet: Arc<dyn WalletSource>) {
        let w = wallet.clone();
        self.register("Wallet.Address", move |_| w.address());
        let w = wallet.clone();
        self.register("Wallet.Descriptor", move |_| w.descriptor());
        self.register("Wallet.PublicKey", move |_| wallet.public_key());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.macros.keys().map(String::as_str).collect()
    }

    pub fn call(&self, name: &str, args: &[String]) -> Result<String> {
        let f = self
            .macros
            .get(name)
            .ok_or_else(|| ServiceError::Template(format!("unknown macro: {name}")))?;
        f(args)
    }

    /// Replace every placeholder in `template`.
    pub fn resolve(&self, template: &str, inputs: &HashMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| ServiceError::Template(format!("unterminated placeholder in {template:?}")))?;
            out.push_str(&self.expand(after[..close].trim(), inputs)?);
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn expand(&self, placeholder: &str, inputs: &HashMap<String, String>) -> Result<String> {
        if let Some(name) = placeholder.strip_prefix("input:") {
            let name = name.trim();
            return inputs
                .get(name)
                .cloned()
                .ok_or_else(|| ServiceError::Template(format!("missing input: {name}")));
        }
        if let Some(call) = placeholder.strip_prefix("macro:") {
            let (name, args) = parse_call(call.trim())?;
            return self.call(name, &args);
        }
        Err(ServiceError::Template(format!(
            "unknown placeholder: {{{{{placeholder}}}}}"
        )))
    }

    /// Resolve a custom command into one shell-quoted command line. All
    /// arguments are resolved before the line is built.
    pub fn resolve_command(
        &self,
        command: &CustomCommand,
        inputs: &HashMap<String, String>,
    ) -> Result<String> {
        let mut tokens = Vec::with_capacity(command.args.len() + 1);
        tokens.push(self.resolve(&command.binary, inputs)?);
        for arg in &command.args {
            tokens.push(self.resolve(arg, inputs)?);
        }
        Ok(shell_words::join(tokens))
    }
}

/// `Name` or `Name(a, b)`; arguments may be quoted.
fn parse_call(call: &str) -> Result<(&str, Vec<String>)> {
    let Some(open) = call.find('(') else {
        return Ok((call, Vec::new()));
    };
    if !call.ends_with(')') {
        return Err(ServiceError::Template(format!("malformed macro call: {call}")));
    }
    let name = call[..open].trim();
    let inner = call[open + 1..call.len() - 1].trim();
    let args = if inner.is_empty() {
        Vec::new()
    } else {
        inner
            .split(',')
            .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .collect()
    };
    Ok((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct FixedWallet;

    impl WalletSource for FixedWallet {
        fn address(&self) -> Result<String> {
            Ok("pocx1qaddr".into())
        }
        fn descriptor(&self) -> Result<String> {
            Ok("wpkh([fp/84h/0h/0h]xpub/0/*)#check".into())
        }
        fn public_key(&self) -> Result<String> {
            Err(ServiceError::Template("no wallet loaded".into()))
        }
    }

    #[test]
    fn input_and_timestamp() {
        let registry = MacroRegistry::with_builtins();
        let out = registry
            .resolve("{{input:addr}} {{macro:Timestamp.Now}}", &inputs(&[("addr", "X")]))
            .unwrap();
        let (addr, ts) = out.split_once(' ').unwrap();
        assert_eq!(addr, "X");
        assert_eq!(ts.len(), 10);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn missing_input_fails() {
        let registry = MacroRegistry::with_builtins();
        let err = registry
            .resolve("{{input:addr}} {{macro:Timestamp.Now}}", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Template(msg) if msg.contains("addr")));
    }

    #[test]
    fn unknown_macro_and_malformed_template() {
        let registry = MacroRegistry::with_builtins();
        assert!(registry.resolve("{{macro:Nope}}", &HashMap::new()).is_err());
        assert!(registry.resolve("{{input:a", &inputs(&[("a", "1")])).is_err());
        assert!(registry.resolve("{{other:a}}", &HashMap::new()).is_err());
        assert_eq!(registry.resolve("plain text", &HashMap::new()).unwrap(), "plain text");
    }

    #[test]
    fn macro_arguments() {
        let mut registry = MacroRegistry::new();
        registry.register("Join", |args| Ok(args.join("+")));
        assert_eq!(
            registry.resolve("{{macro:Join(a, \"b\", c)}}", &HashMap::new()).unwrap(),
            "a+b+c"
        );
        assert_eq!(registry.resolve("{{ macro:Join() }}", &HashMap::new()).unwrap(), "");
    }

    #[test]
    fn wallet_macros() {
        let mut registry = MacroRegistry::new();
        registry.register_wallet(Arc::new(FixedWallet));
        assert_eq!(
            registry.resolve("{{macro:Wallet.Address}}", &HashMap::new()).unwrap(),
            "pocx1qaddr"
        );
        assert!(registry.resolve("{{macro:Wallet.PublicKey}}", &HashMap::new()).is_err());
    }

    #[test]
    fn command_line_is_quoted() {
        let registry = MacroRegistry::with_builtins();
        let mut command = CustomCommand::default();
        command.binary = "bitcoin-cli".into();
        command.args = vec![
            "importdescriptors".into(),
            "[{\"desc\": \"{{macro:Wallet.Descriptor}}\"}]".into(),
        ];
        assert!(registry.resolve_command(&command, &HashMap::new()).is_err());

        command.args = vec!["-named".into(), "label={{input:label}}".into()];
        let line = registry
            .resolve_command(&command, &inputs(&[("label", "my miner")]))
            .unwrap();
        assert_eq!(
            shell_words::split(&line).unwrap(),
            vec!["bitcoin-cli", "-named", "label=my miner"]
        );
    }
}
