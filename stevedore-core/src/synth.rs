//! Command synthesis: turns a service definition into the argument vector and the
//! port / volume / environment bindings a backend needs.
//!
//! Everything here is pure. Identical definitions always produce identical output,
//! and tokens follow declaration order.

use crate::backend::{EnvBinding, PortBinding, VolumeBinding};
use crate::document::{ParamKind, Parameter, ServiceDefinition};

/// Full command: declared container binary, legacy base command, then parameters.
pub fn synthesize_command(service: &ServiceDefinition) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(binary) = service
        .container_spec
        .as_ref()
        .and_then(|c| c.binary.as_deref())
        .filter(|b| !b.trim().is_empty())
    {
        tokens.push(binary.to_string());
    }
    tokens.extend(synthesize_arguments(service));
    tokens
}

/// Arguments without the binary: legacy base command followed by parameter flags.
pub fn synthesize_arguments(service: &ServiceDefinition) -> Vec<String> {
    let mut tokens: Vec<String> = service
        .container_spec
        .as_ref()
        .map(|c| c.command.clone())
        .unwrap_or_default();
    tokens.extend(parameter_arguments(service));
    tokens
}

/// Parameter flags only, as passed to a native binary.
pub fn parameter_arguments(service: &ServiceDefinition) -> Vec<String> {
    let mut tokens = Vec::new();
    for param in &service.parameters {
        emit_parameter(param, &mut tokens);
    }
    tokens
}

fn emit_parameter(param: &Parameter, tokens: &mut Vec<String>) {
    if param.hidden {
        return;
    }
    let Some(value) = param.value.as_ref() else {
        return;
    };

    match param.kind {
        // 只有 true 才输出，false 与未设置等价
        ParamKind::Bool => {
            if value.is_true() {
                tokens.push(param.flag.clone());
            }
        }
        ParamKind::Int | ParamKind::String => {
            push_flag(param, &value.render(), tokens);
        }
        ParamKind::StringList => {
            for item in value.as_list() {
                push_flag(param, &item, tokens);
            }
        }
    }
}

fn push_flag(param: &Parameter, value: &str, tokens: &mut Vec<String>) {
    if param.equals_syntax() {
        tokens.push(format!("{}={}", param.flag, value));
    } else {
        tokens.push(param.flag.clone());
        tokens.push(value.to_string());
    }
}

/// Port bindings in declaration order; optional ports without an override are skipped.
pub fn port_bindings(service: &ServiceDefinition) -> Vec<PortBinding> {
    service
        .ports
        .iter()
        .filter_map(|p| {
            p.effective_host_port().map(|host| PortBinding {
                host,
                container: p.container_port,
                protocol: p.protocol.clone(),
            })
        })
        .collect()
}

/// Volume bindings; mappings without any host path are skipped.
pub fn volume_bindings(service: &ServiceDefinition) -> Vec<VolumeBinding> {
    service
        .volumes
        .iter()
        .filter_map(|v| {
            v.effective_host_path().map(|host| VolumeBinding {
                host: host.to_string(),
                container: v.container_path.clone(),
                read_only: v.read_only,
                is_file: v.is_file,
            })
        })
        .collect()
}

/// Environment variables with an effective value.
pub fn environment(service: &ServiceDefinition) -> Vec<EnvBinding> {
    service
        .environment
        .iter()
        .filter_map(|e| {
            e.effective_value().map(|value| EnvBinding {
                name: e.name.clone(),
                value: value.to_string(),
                sensitive: e.sensitive,
            })
        })
        .collect()
}

/// Required parameters that have neither a user value nor a declared default.
pub fn missing_required(service: &ServiceDefinition) -> Vec<&str> {
    service
        .parameters
        .iter()
        .filter(|p| p.required && p.effective().is_none())
        .map(|p| p.name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContainerSpec, EnvVar, ParamValue, PortMapping, VolumeMapping};

    fn param(name: &str, flag: &str, kind: ParamKind, value: Option<ParamValue>) -> Parameter {
        let mut p = Parameter::new(name, flag, kind);
        p.value = value;
        p
    }

    fn node() -> ServiceDefinition {
        let mut svc = ServiceDefinition::new("node", "Node");
        svc.container_spec = Some(ContainerSpec {
            image: "pocx-node".into(),
            binary: Some("bitcoind".into()),
            command: vec!["-printtoconsole".into()],
            ..Default::default()
        });
        svc
    }

    #[test]
    fn binary_then_base_command_then_parameters() {
        let mut svc = node();
        svc.parameters = vec![
            param("server", "-server", ParamKind::Bool, Some(ParamValue::Bool(true))),
            param("rpcport", "-rpcport", ParamKind::Int, Some(ParamValue::Int(18332))),
            param("datadir", "-datadir", ParamKind::String, None),
        ];
        assert_eq!(
            synthesize_command(&svc),
            vec!["bitcoind", "-printtoconsole", "-server", "-rpcport=18332"]
        );
        assert_eq!(
            synthesize_arguments(&svc),
            vec!["-printtoconsole", "-server", "-rpcport=18332"]
        );
    }

    #[test]
    fn false_bool_is_never_emitted_true_exactly_once() {
        let mut svc = node();
        svc.parameters = vec![param("testnet", "-testnet", ParamKind::Bool, Some(ParamValue::Bool(false)))];
        assert!(!synthesize_command(&svc).contains(&"-testnet".to_string()));

        svc.parameters[0].value = Some(ParamValue::Bool(true));
        let tokens = synthesize_command(&svc);
        assert_eq!(tokens.iter().filter(|t| *t == "-testnet").count(), 1);
    }

    #[test]
    fn space_syntax_and_hidden() {
        let mut svc = node();
        let mut threads = param("threads", "--threads", ParamKind::Int, Some(ParamValue::Int(4)));
        threads.use_equals = Some(false);
        let mut secret = param("key", "--key", ParamKind::String, Some(ParamValue::Text("x".into())));
        secret.hidden = true;
        svc.parameters = vec![threads, secret];
        assert_eq!(synthesize_arguments(&svc), vec!["-printtoconsole", "--threads", "4"]);
    }

    #[test]
    fn string_list_emits_one_flag_per_element() {
        let mut svc = node();
        svc.container_spec.as_mut().unwrap().command.clear();
        let list = param(
            "addnode",
            "-addnode",
            ParamKind::StringList,
            Some(ParamValue::List(vec!["a:1".into(), "b:2".into()])),
        );
        let mut joined = param(
            "path",
            "--path",
            ParamKind::StringList,
            Some(ParamValue::Text("/p1, /p2".into())),
        );
        joined.use_equals = Some(false);
        svc.parameters = vec![list, joined];
        assert_eq!(
            synthesize_arguments(&svc),
            vec!["-addnode=a:1", "-addnode=b:2", "--path", "/p1", "--path", "/p2"]
        );
    }

    #[test]
    fn deterministic_for_identical_input() {
        let mut svc = node();
        svc.parameters = vec![
            param("a", "--a", ParamKind::String, Some(ParamValue::Text("1".into()))),
            param("b", "--b", ParamKind::Bool, Some(ParamValue::Bool(true))),
        ];
        let first = synthesize_command(&svc);
        let again = synthesize_command(&svc.clone());
        assert_eq!(first, again);
    }

    #[test]
    fn defaults_alone_are_not_emitted() {
        let mut svc = node();
        let mut p = param("rpcport", "-rpcport", ParamKind::Int, None);
        p.default = Some(ParamValue::Int(8332));
        svc.parameters = vec![p];
        assert_eq!(synthesize_command(&svc), vec!["bitcoind", "-printtoconsole"]);
    }

    #[test]
    fn bindings_follow_resolution() {
        let mut svc = node();
        let mut optional = PortMapping::new(9999);
        optional.optional = true;
        svc.ports = vec![PortMapping::new(8332), optional];
        let mut data = VolumeMapping::new("/data", "./data/node");
        data.host_override = Some("/mnt/node".into());
        let mut empty = VolumeMapping::new("/unused", "");
        empty.host_path = None;
        svc.volumes = vec![data, empty];
        svc.environment = vec![EnvVar::new("NETWORK", "testnet")];

        let ports = port_bindings(&svc);
        assert_eq!(ports.len(), 1);
        assert_eq!((ports[0].host, ports[0].container), (8332, 8332));

        let volumes = volume_bindings(&svc);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].host, "/mnt/node");

        let env = environment(&svc);
        assert_eq!(env[0].name, "NETWORK");
        assert_eq!(env[0].value, "testnet");
    }

    #[test]
    fn required_without_value_or_default_is_reported() {
        let mut svc = node();
        let mut p = param("address", "--address", ParamKind::String, None);
        p.required = true;
        svc.parameters = vec![p];
        assert_eq!(missing_required(&svc), vec!["address"]);
    }
}
