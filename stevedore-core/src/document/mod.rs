//! 声明式服务文档：服务定义、全局默认值以及用户覆盖项。
//!
//! 所有字段使用 camelCase 命名；未知字段通过 `extra` 原样保留，保证 load → save 不丢数据。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

mod params;
mod resolve;
mod shape;

pub use params::{ParamKind, ParamValue, Parameter};
pub(crate) use shape::restore_explicit_empties;

/// 未知字段容器
pub type Extra = Map<String, Value>;

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}

pub const DEFAULT_NETWORK: &str = "stevedore";
pub const DEFAULT_CONTAINER_PREFIX: &str = "stevedore";
pub const DEFAULT_RESTART_POLICY: &str = "unless-stopped";
pub const DEFAULT_ENGINE: &str = "docker";
pub const DEFAULT_TAG: &str = "latest";

/// 服务文档根节点
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDocument {
    /// 全局默认值（共享网络、重启策略、日志轮转）
    #[serde(default, skip_serializing_if = "GlobalDefaults::is_unset")]
    pub defaults: GlobalDefaults,
    /// 服务定义列表，顺序即展示顺序
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ServiceDocument {
    pub fn service(&self, id: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn service_mut(&mut self, id: &str) -> Option<&mut ServiceDefinition> {
        self.services.iter_mut().find(|s| s.id == id)
    }
}

/// 全局默认值
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalDefaults {
    /// 共享容器网络名
    pub network: Option<String>,
    /// 容器名回退前缀：`<prefix>-<id>`
    pub container_prefix: Option<String>,
    /// 容器重启策略（`--restart`）
    pub restart_policy: Option<String>,
    /// 容器日志轮转策略
    pub log_rotation: Option<LogRotation>,
    /// 容器引擎 CLI（docker / podman）
    pub engine: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl GlobalDefaults {
    fn is_unset(&self) -> bool {
        *self == Self::default()
    }

    pub fn network(&self) -> &str {
        self.network.as_deref().unwrap_or(DEFAULT_NETWORK)
    }

    pub fn container_prefix(&self) -> &str {
        self.container_prefix
            .as_deref()
            .unwrap_or(DEFAULT_CONTAINER_PREFIX)
    }

    pub fn restart_policy(&self) -> &str {
        self.restart_policy
            .as_deref()
            .unwrap_or(DEFAULT_RESTART_POLICY)
    }

    pub fn engine(&self) -> &str {
        self.engine.as_deref().unwrap_or(DEFAULT_ENGINE)
    }
}

/// 日志轮转：对应容器引擎的 `--log-opt max-size / max-file`
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogRotation {
    pub max_size: Option<String>,
    pub max_files: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 执行模式：容器或本地进程
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Container,
    Process,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Process => "process",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(Self::Container),
            "process" | "native" => Ok(Self::Process),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// 单个服务定义
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// 稳定主键
    pub id: String,
    /// 显示名称
    pub name: String,
    pub description: Option<String>,
    /// 当前生效的执行模式；另一模式的配置仍保留在文档中
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// 容器模式配置
    pub container_spec: Option<ContainerSpec>,
    /// 本地进程模式配置
    pub process_spec: Option<ProcessSpec>,
    /// 版本来源（静态列表 / 远程发现）
    pub source_spec: Option<SourceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvVar>,
    /// 命令行参数，声明顺序决定最终命令形态
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub menu: Vec<MenuItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_commands: Vec<CustomCommand>,
    /// 用户覆盖：容器名
    pub name_override: Option<String>,
    /// 用户覆盖：网络
    pub network_override: Option<String>,
    /// 用户选择的镜像版本（容器模式）
    pub image_override: Option<ImageVersion>,
    /// 用户选择的发布版本（进程模式）
    pub release_override: Option<ReleaseVersion>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ServiceDefinition {
    /// 构造一个最小定义，其余字段留空。
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            execution_mode: ExecutionMode::Container,
            container_spec: None,
            process_spec: None,
            source_spec: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            environment: Vec::new(),
            parameters: Vec::new(),
            menu: Vec::new(),
            custom_commands: Vec::new(),
            name_override: None,
            network_override: None,
            image_override: None,
            release_override: None,
            extra: Extra::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    pub fn custom_command(&self, id: &str) -> Option<&CustomCommand> {
        self.custom_commands.iter().find(|c| c.id == id)
    }
}

/// 容器配置
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// 镜像名（不含仓库前缀）
    pub image: String,
    /// 镜像仓库，如 `ghcr.io/owner`
    pub repository: Option<String>,
    /// 默认 tag
    pub tag: Option<String>,
    /// 容器内可执行文件名；作为命令首个 token
    pub binary: Option<String>,
    pub working_dir: Option<String>,
    /// 声明的容器名默认值
    pub container_name: Option<String>,
    /// 是否透传 GPU（`--gpus all`）
    #[serde(default, skip_serializing_if = "is_false")]
    pub gpu: bool,
    /// 旧版固定基础命令，紧跟在 binary 之后
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 进程输出策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputPolicy {
    /// 输出写入 `<service-dir>/logs/latest.log`
    #[default]
    Log,
    /// 继承当前终端，前台可见
    Foreground,
}

/// 本地进程配置
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// 服务目录下的可执行文件名；缺省时沿用 containerSpec.binary
    pub binary: Option<String>,
    /// 工作目录；缺省为服务目录
    pub working_dir: Option<String>,
    pub output: Option<OutputPolicy>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 版本来源
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub container: Option<ContainerSource>,
    pub process: Option<ProcessSource>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSource {
    /// 静态镜像版本列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ImageVersion>,
    /// 远程 tag 发现
    pub discovery: Option<DiscoverySpec>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSource {
    /// 静态下载列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ReleaseVersion>,
    /// 远程 release 发现
    pub discovery: Option<DiscoverySpec>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 远程发现描述
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySpec {
    /// 仓库 / 包地址
    pub url: String,
    /// 过滤正则；缺省匹配全部
    pub filter: Option<String>,
    /// 指定 release tag；缺省取最新
    pub release: Option<String>,
    /// 资产名白名单
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl DiscoverySpec {
    pub fn filter(&self) -> &str {
        self.filter.as_deref().unwrap_or(".*")
    }
}

/// 镜像版本候选
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageVersion {
    pub repository: Option<String>,
    pub image: String,
    pub tag: String,
}

impl ImageVersion {
    /// 完整镜像引用 `<repository>/<image>:<tag>`
    pub fn reference(&self) -> String {
        match self.repository.as_deref().filter(|r| !r.is_empty()) {
            Some(repo) => format!("{}/{}:{}", repo.trim_end_matches('/'), self.image, self.tag),
            None => format!("{}:{}", self.image, self.tag),
        }
    }
}

/// 发布版本候选
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseVersion {
    pub url: String,
    pub version: String,
    /// 目标平台，如 `linux-x64`
    pub platform: Option<String>,
}

/// 端口映射
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    /// 用户覆盖的宿主端口
    #[serde(rename = "override")]
    pub host_override: Option<u16>,
    /// 可选端口：未设置覆盖时不映射
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    /// tcp / udp
    pub protocol: Option<String>,
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl PortMapping {
    pub fn new(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            host_override: None,
            optional: false,
            protocol: None,
            description: None,
            extra: Extra::new(),
        }
    }
}

/// 卷映射
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    pub container_path: String,
    pub host_path: Option<String>,
    #[serde(rename = "override")]
    pub host_override: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    /// 单文件挂载：首次启动只创建父目录
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_file: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl VolumeMapping {
    pub fn new(container_path: impl Into<String>, host_path: impl Into<String>) -> Self {
        Self {
            container_path: container_path.into(),
            host_path: Some(host_path.into()),
            host_override: None,
            read_only: false,
            is_file: false,
            extra: Extra::new(),
        }
    }
}

/// 环境变量
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    /// 声明默认值
    pub value: Option<String>,
    #[serde(rename = "override")]
    pub value_override: Option<String>,
    /// 敏感值：任何输出中都不回显
    #[serde(default, skip_serializing_if = "is_false")]
    pub sensitive: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_override: None,
            sensitive: false,
            extra: Extra::new(),
        }
    }
}

impl std::fmt::Debug for EnvVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| match v {
            Some(_) if self.sensitive => Some("***".to_string()),
            other => other.clone(),
        };
        f.debug_struct("EnvVar")
            .field("name", &self.name)
            .field("value", &mask(&self.value))
            .field("value_override", &mask(&self.value_override))
            .field("sensitive", &self.sensitive)
            .finish_non_exhaustive()
    }
}

/// 菜单动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MenuAction {
    Start,
    Stop,
    Restart,
    Status,
    Logs,
    Versions,
    Parameters,
    Custom,
}

/// 菜单项；`Custom` 通过 `command` 引用 customCommands 中的 id
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub label: String,
    pub action: MenuAction,
    pub command: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 自定义命令：binary + 模板参数 + 输入提示
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    pub id: String,
    pub label: Option<String>,
    pub binary: String,
    /// 支持 `{{input:<name>}}` 与 `{{macro:<Name>(args)}}` 占位符
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<CommandInput>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 输入类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    Int,
    Bool,
    Secret,
}

/// 自定义命令的输入提示
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandInput {
    pub name: String,
    pub prompt: Option<String>,
    #[serde(default)]
    pub kind: InputKind,
    /// 提示时预填的值；模板解析不会使用它
    pub default: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}
