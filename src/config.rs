#![allow(non_snake_case)]
//! 应用配置模块

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::logging::LogConfig;

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Swift,
    S3,
    Local,
}

/// 端点配置（凭据对同步核心是不透明的）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(rename = "type", default = "default_storage_type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authUrl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenantName: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessKey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secretKey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_storage_type() -> StorageType {
    StorageType::Swift
}

impl EndpointConfig {
    pub fn local(path: &str) -> Self {
        Self {
            typ: StorageType::Local,
            authUrl: None,
            username: None,
            password: None,
            tenantName: None,
            region: None,
            bucket: None,
            accessKey: None,
            secretKey: None,
            endpoint: None,
            path: Some(path.to_string()),
        }
    }

    /// 取必填字段，缺失时返回配置错误
    pub fn required<'a>(&self, field: &str, value: Option<&'a String>) -> Result<&'a str> {
        value
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("{:?} storage requires {}", self.typ, field))
    }

    /// 端点身份（不含密码），用于区分暂存目录
    pub fn identity(&self) -> String {
        match self.typ {
            StorageType::Swift => format!(
                "swift|{}|{}|{}|{}",
                self.authUrl.as_deref().unwrap_or_default(),
                self.username.as_deref().unwrap_or_default(),
                self.tenantName.as_deref().unwrap_or_default(),
                self.region.as_deref().unwrap_or_default()
            ),
            StorageType::S3 => format!(
                "s3|{}|{}|{}",
                self.endpoint.as_deref().unwrap_or_default(),
                self.region.as_deref().unwrap_or_default(),
                self.bucket.as_deref().unwrap_or_default()
            ),
            StorageType::Local => format!("local|{}", self.path.as_deref().unwrap_or_default()),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 单个对象的最大尝试次数（含第一次）
    #[serde(default = "default_max_attempts")]
    pub maxAttempts: u32,
    /// 重试基础延迟（毫秒），按 2 的幂递增，0 表示不等待
    #[serde(default = "default_retry_base_delay_ms")]
    pub retryBaseDelayMs: u64,
    /// 最大并发传输数
    #[serde(default = "default_max_concurrent_transfers")]
    pub maxConcurrentTransfers: usize,
    /// 已暂存文件大小一致时是否仍重新计算 MD5
    #[serde(default)]
    pub verifyStaged: bool,
    /// 暂存目录是否按源端点隔离
    #[serde(default = "default_isolate_staging")]
    pub isolateStaging: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_isolate_staging() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            maxAttempts: default_max_attempts(),
            retryBaseDelayMs: default_retry_base_delay_ms(),
            maxConcurrentTransfers: default_max_concurrent_transfers(),
            verifyStaged: false,
            isolateStaging: default_isolate_staging(),
        }
    }
}

/// 完整的同步配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    /// 容器名过滤（正则，在名称任意位置匹配），空串匹配全部
    #[serde(default)]
    pub prefix: String,
    /// 本地暂存根目录
    #[serde(default = "default_local_path")]
    pub localPath: String,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_local_path() -> String {
    "mirror-dir".to_string()
}

impl AppConfig {
    /// 从 JSON 文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("解析配置文件失败: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.maxAttempts == 0 {
            return Err(anyhow!("transfer.maxAttempts must be at least 1"));
        }
        if self.transfer.maxConcurrentTransfers == 0 {
            return Err(anyhow!("transfer.maxConcurrentTransfers must be at least 1"));
        }
        if self.localPath.trim().is_empty() {
            return Err(anyhow!("localPath must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_json(
            r#"{
                "source": {
                    "authUrl": "https://identity.example.com/v2.0",
                    "username": "u", "password": "p",
                    "tenantName": "t", "region": "DFW"
                },
                "destination": { "type": "local", "path": "/tmp/dest" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.source.typ, StorageType::Swift);
        assert_eq!(config.destination.typ, StorageType::Local);
        assert_eq!(config.prefix, "");
        assert_eq!(config.localPath, "mirror-dir");
        assert_eq!(config.transfer.maxAttempts, 3);
        assert!(!config.transfer.verifyStaged);
        assert!(config.transfer.isolateStaging);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = AppConfig::from_json(
            r#"{
                "source": { "type": "local", "path": "a" },
                "destination": { "type": "local", "path": "b" },
                "transfer": { "maxAttempts": 0 }
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("maxAttempts"));
    }

    #[test]
    fn test_required_reports_field_name() {
        let endpoint = EndpointConfig {
            typ: StorageType::Swift,
            ..EndpointConfig::local("x")
        };
        let err = endpoint.required("authUrl", endpoint.authUrl.as_ref()).unwrap_err();
        assert!(err.to_string().contains("authUrl"));
    }

    #[test]
    fn test_identity_excludes_password() {
        let mut endpoint = EndpointConfig::local("x");
        endpoint.typ = StorageType::Swift;
        endpoint.username = Some("alice".into());
        endpoint.password = Some("s3cret".into());
        assert!(endpoint.identity().contains("alice"));
        assert!(!endpoint.identity().contains("s3cret"));
    }
}
