//! 服务注册表：加载 / 落盘服务文档，所有用户编辑都经由这里并立即整体写回。

use crate::document::{
    restore_explicit_empties, ExecutionMode, GlobalDefaults, ImageVersion, ParamValue,
    ReleaseVersion, ServiceDefinition, ServiceDocument,
};
use crate::error::{Result, ServiceError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{instrument, warn};

/// 读取原始 JSON 与解析后的文档；文件缺失或损坏时告警并返回 None。
async fn read_document(path: &Path) -> Option<(ServiceDocument, Value)> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "service document not readable; no services available");
            return None;
        }
    };
    let parsed = serde_json::from_slice::<Value>(&data).and_then(|raw| {
        let doc = serde_json::from_value::<ServiceDocument>(raw.clone())?;
        Ok((doc, raw))
    });
    match parsed {
        Ok(pair) => Some(pair),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "service document is corrupt; no services available");
            None
        }
    }
}

/// 从磁盘读取文档；文件缺失或损坏时告警并返回 None。
pub async fn load_document(path: &Path) -> Option<ServiceDocument> {
    read_document(path).await.map(|(doc, _)| doc)
}

/// 整体覆盖写入文档（幂等）。目标文件中显式写出的空值会被保留。
pub async fn save_document(path: &Path, document: &ServiceDocument) -> Result<()> {
    let shape = match tokio::fs::read(path).await {
        Ok(data) => serde_json::from_slice::<Value>(&data).ok(),
        Err(_) => None,
    };
    write_document(path, document, shape.as_ref()).await
}

async fn write_document(path: &Path, document: &ServiceDocument, shape: Option<&Value>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut value = serde_json::to_value(document)?;
    if let Some(shape) = shape {
        value = restore_explicit_empties(value, shape);
    }
    let mut data = serde_json::to_vec_pretty(&value)?;
    data.push(b'\n');
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// 内存中的服务文档 + 落盘路径。
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    path: PathBuf,
    document: ServiceDocument,
    /// 加载时的原始 JSON，写回时用来保留显式空值
    shape: Option<Value>,
}

impl ServiceRegistry {
    /// 打开注册表；文档不可用时以空服务集继续。
    pub async fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        match read_document(&path).await {
            Some((document, raw)) => Self {
                path,
                document,
                shape: Some(raw),
            },
            None => Self {
                path,
                document: ServiceDocument::default(),
                shape: None,
            },
        }
    }

    /// 使用已构造的文档（测试或嵌入场景）。
    pub fn with_document<P: AsRef<Path>>(path: P, document: ServiceDocument) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document,
            shape: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ServiceDocument {
        &self.document
    }

    pub fn defaults(&self) -> &GlobalDefaults {
        &self.document.defaults
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.document.services
    }

    pub fn service(&self, id: &str) -> Result<&ServiceDefinition> {
        self.document
            .service(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// 写回整个文档。
    pub async fn save(&self) -> Result<()> {
        match &self.shape {
            Some(shape) => write_document(&self.path, &self.document, Some(shape)).await,
            None => save_document(&self.path, &self.document).await,
        }
    }

    /// 修改单个服务并立即写回；闭包返回错误时不落盘。
    ///
    /// 校验在闭包内先于赋值完成，所以失败时内存中的旧值保持不变。
    #[instrument(skip(self, edit))]
    pub async fn edit<F>(&mut self, id: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceDefinition) -> Result<()>,
    {
        let service = self
            .document
            .service_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        edit(service)?;
        self.save().await
    }

    /// 设置参数用户值（经过类型 / 范围 / 枚举校验）。
    pub async fn set_parameter(&mut self, id: &str, name: &str, value: ParamValue) -> Result<()> {
        self.edit(id, |svc| {
            let param = svc
                .parameter_mut(name)
                .ok_or_else(|| ServiceError::Validation(format!("unknown parameter: {name}")))?;
            param.validate(&value)?;
            param.value = Some(value);
            Ok(())
        })
        .await
    }

    /// 解析原始输入后设置参数。
    pub async fn set_parameter_raw(&mut self, id: &str, name: &str, raw: &str) -> Result<()> {
        let value = {
            let svc = self.service(id)?;
            let param = svc
                .parameter(name)
                .ok_or_else(|| ServiceError::Validation(format!("unknown parameter: {name}")))?;
            param.parse(raw)?
        };
        self.set_parameter(id, name, value).await
    }

    /// 清除参数用户值，回到“未设置”（不再出现在命令中）。
    pub async fn reset_parameter(&mut self, id: &str, name: &str) -> Result<()> {
        self.edit(id, |svc| {
            let param = svc
                .parameter_mut(name)
                .ok_or_else(|| ServiceError::Validation(format!("unknown parameter: {name}")))?;
            param.value = None;
            Ok(())
        })
        .await
    }

    pub async fn set_name_override(&mut self, id: &str, name: Option<String>) -> Result<()> {
        if let Some(n) = name.as_deref() {
            crate::backend::validate_name(n)?;
        }
        self.edit(id, |svc| {
            svc.name_override = name;
            Ok(())
        })
        .await
    }

    pub async fn set_network_override(&mut self, id: &str, network: Option<String>) -> Result<()> {
        if let Some(n) = network.as_deref() {
            crate::backend::validate_name(n)?;
        }
        self.edit(id, |svc| {
            svc.network_override = network;
            Ok(())
        })
        .await
    }

    /// 覆盖宿主端口；None 表示恢复默认。
    pub async fn set_port_override(
        &mut self,
        id: &str,
        container_port: u16,
        host_port: Option<u16>,
    ) -> Result<()> {
        self.edit(id, |svc| {
            let port = svc
                .ports
                .iter_mut()
                .find(|p| p.container_port == container_port)
                .ok_or_else(|| {
                    ServiceError::Validation(format!("no port mapping for {container_port}"))
                })?;
            port.host_override = host_port;
            Ok(())
        })
        .await
    }

    pub async fn set_volume_override(
        &mut self,
        id: &str,
        container_path: &str,
        host_path: Option<String>,
    ) -> Result<()> {
        self.edit(id, |svc| {
            let volume = svc
                .volumes
                .iter_mut()
                .find(|v| v.container_path == container_path)
                .ok_or_else(|| {
                    ServiceError::Validation(format!("no volume mapping for {container_path}"))
                })?;
            volume.host_override = host_path;
            Ok(())
        })
        .await
    }

    pub async fn set_env_override(
        &mut self,
        id: &str,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        self.edit(id, |svc| {
            let var = svc
                .environment
                .iter_mut()
                .find(|e| e.name == name)
                .ok_or_else(|| ServiceError::Validation(format!("unknown variable: {name}")))?;
            var.value_override = value;
            Ok(())
        })
        .await
    }

    /// 切换执行模式；另一模式的配置原样保留。
    pub async fn set_execution_mode(&mut self, id: &str, mode: ExecutionMode) -> Result<()> {
        self.edit(id, |svc| {
            svc.execution_mode = mode;
            Ok(())
        })
        .await
    }

    pub async fn set_image_override(&mut self, id: &str, image: Option<ImageVersion>) -> Result<()> {
        self.edit(id, |svc| {
            svc.image_override = image;
            Ok(())
        })
        .await
    }

    pub async fn set_release_override(
        &mut self,
        id: &str,
        release: Option<ReleaseVersion>,
    ) -> Result<()> {
        self.edit(id, |svc| {
            svc.release_override = release;
            Ok(())
        })
        .await
    }
}
