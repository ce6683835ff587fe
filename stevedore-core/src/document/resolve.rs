//! 有效值解析：用户覆盖 → 声明默认值 → 合成回退值。
//!
//! 纯函数，只读文档，从不把解析结果写回。

use super::*;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl ServiceDefinition {
    /// 容器名：nameOverride → containerSpec.containerName → `<prefix>-<id>`
    pub fn container_name(&self, defaults: &GlobalDefaults) -> String {
        non_empty(self.name_override.as_deref())
            .or_else(|| {
                non_empty(
                    self.container_spec
                        .as_ref()
                        .and_then(|c| c.container_name.as_deref()),
                )
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", defaults.container_prefix(), self.id))
    }

    /// 网络：networkOverride → 全局共享网络
    pub fn network(&self, defaults: &GlobalDefaults) -> String {
        non_empty(self.network_override.as_deref())
            .unwrap_or_else(|| defaults.network())
            .to_string()
    }

    /// 当前镜像版本：imageOverride → containerSpec 声明的 image/tag
    pub fn image(&self) -> Option<ImageVersion> {
        if let Some(selected) = &self.image_override {
            return Some(selected.clone());
        }
        let spec = self.container_spec.as_ref()?;
        if spec.image.trim().is_empty() {
            return None;
        }
        Some(ImageVersion {
            repository: spec.repository.clone(),
            image: spec.image.clone(),
            tag: non_empty(spec.tag.as_deref())
                .unwrap_or(DEFAULT_TAG)
                .to_string(),
        })
    }

    /// 当前发布版本：releaseOverride → 静态列表中匹配本机平台的第一项 → 第一项
    pub fn release(&self) -> Option<ReleaseVersion> {
        if let Some(selected) = &self.release_override {
            return Some(selected.clone());
        }
        let versions = &self.source_spec.as_ref()?.process.as_ref()?.versions;
        let platform = crate::discovery::host_platform();
        versions
            .iter()
            .find(|v| v.platform.as_deref() == Some(platform.as_str()))
            .or_else(|| versions.first())
            .cloned()
    }

    /// 本地进程可执行文件名：processSpec.binary → containerSpec.binary
    pub fn process_binary(&self) -> Option<&str> {
        non_empty(self.process_spec.as_ref().and_then(|p| p.binary.as_deref())).or_else(|| {
            non_empty(self.container_spec.as_ref().and_then(|c| c.binary.as_deref()))
        })
    }

    pub fn output_policy(&self) -> OutputPolicy {
        self.process_spec
            .as_ref()
            .and_then(|p| p.output)
            .unwrap_or_default()
    }

    /// 当前执行模式下的实例标识：容器名或服务 id
    pub fn instance_name(&self, defaults: &GlobalDefaults) -> String {
        match self.execution_mode {
            ExecutionMode::Container => self.container_name(defaults),
            ExecutionMode::Process => self.id.clone(),
        }
    }
}

impl PortMapping {
    /// 宿主端口：override → hostPort → 与容器端口相同；可选端口仅在有覆盖时映射
    pub fn effective_host_port(&self) -> Option<u16> {
        if let Some(port) = self.host_override {
            return Some(port);
        }
        if self.optional {
            return None;
        }
        Some(self.host_port.unwrap_or(self.container_port))
    }
}

impl VolumeMapping {
    /// 宿主路径：override → hostPath；均为空则不挂载
    pub fn effective_host_path(&self) -> Option<&str> {
        non_empty(self.host_override.as_deref()).or_else(|| non_empty(self.host_path.as_deref()))
    }
}

impl EnvVar {
    /// 变量值：override → 默认值
    pub fn effective_value(&self) -> Option<&str> {
        self.value_override.as_deref().or(self.value.as_deref())
    }

    /// 展示用值，敏感变量一律遮蔽
    pub fn display_value(&self) -> Option<String> {
        self.effective_value().map(|v| {
            if self.sensitive {
                "***".to_string()
            } else {
                v.to_string()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceDefinition {
        let mut svc = ServiceDefinition::new("node", "Node");
        svc.container_spec = Some(ContainerSpec {
            image: "pocx-node".into(),
            repository: Some("ghcr.io/pocx".into()),
            tag: Some("v1.0.0".into()),
            ..Default::default()
        });
        svc
    }

    #[test]
    fn container_name_precedence() {
        let defaults = GlobalDefaults::default();
        let mut svc = service();
        assert_eq!(svc.container_name(&defaults), "stevedore-node");

        svc.container_spec.as_mut().unwrap().container_name = Some("declared".into());
        assert_eq!(svc.container_name(&defaults), "declared");

        svc.name_override = Some("mine".into());
        assert_eq!(svc.container_name(&defaults), "mine");

        svc.name_override = Some("  ".into());
        assert_eq!(svc.container_name(&defaults), "declared");
    }

    #[test]
    fn image_override_wins() {
        let mut svc = service();
        assert_eq!(svc.image().unwrap().reference(), "ghcr.io/pocx/pocx-node:v1.0.0");
        svc.image_override = Some(ImageVersion {
            repository: Some("ghcr.io/pocx".into()),
            image: "pocx-node".into(),
            tag: "v2.0.0".into(),
        });
        assert_eq!(svc.image().unwrap().reference(), "ghcr.io/pocx/pocx-node:v2.0.0");
    }

    #[test]
    fn port_precedence_and_optional() {
        let mut port = PortMapping::new(8332);
        assert_eq!(port.effective_host_port(), Some(8332));
        port.host_port = Some(18332);
        assert_eq!(port.effective_host_port(), Some(18332));
        port.optional = true;
        assert_eq!(port.effective_host_port(), None);
        port.host_override = Some(28332);
        assert_eq!(port.effective_host_port(), Some(28332));
    }

    #[test]
    fn env_override_and_masking() {
        let mut env = EnvVar::new("RPC_PASS", "default");
        env.value_override = Some("secret".into());
        env.sensitive = true;
        assert_eq!(env.effective_value(), Some("secret"));
        assert_eq!(env.display_value().as_deref(), Some("***"));
        assert!(!format!("{env:?}").contains("secret"));
    }
}
