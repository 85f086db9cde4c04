//! 端点模型
//!
//! 端点是对外暴露的 HTTP 路由对象（如 OpenShift Route）在控制器内部的快照。
//! 它只保留证书生命周期需要的字段：主机名、TLS 终止配置、注解以及用于
//! 乐观并发控制的资源版本。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 边缘终止
pub const TERMINATION_EDGE: &str = "edge";
/// 重新加密终止
pub const TERMINATION_REENCRYPT: &str = "reencrypt";
/// 透传终止，控制器无法为其注入证书
pub const TERMINATION_PASSTHROUGH: &str = "passthrough";

/// 端点标识（命名空间/名称）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    /// 命名空间
    pub namespace: String,
    /// 名称
    pub name: String,
}

impl EndpointKey {
    /// 创建新的端点标识
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for EndpointKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::Fatal(format!("无效的端点标识: {}", s))),
        }
    }
}

/// TLS 终止配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// 终止方式：edge、reencrypt 或 passthrough
    pub termination: String,
    /// 证书链（PEM 格式）
    pub certificate: Option<String>,
    /// 私钥（PEM 格式）
    pub key: Option<String>,
    /// 明文流量策略：Allow、Redirect 或 None
    pub insecure_edge_termination_policy: Option<String>,
}

impl TlsConfig {
    /// 是否同时携带证书与私钥
    pub fn has_certificate(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.certificate) && present(&self.key)
    }
}

/// 端点快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// 端点标识
    pub key: EndpointKey,
    /// 主机名
    pub host: String,
    /// 注解
    pub annotations: BTreeMap<String, String>,
    /// TLS 配置
    pub tls: Option<TlsConfig>,
    /// 资源版本，条件写入的前提
    pub resource_version: Option<String>,
}

impl Endpoint {
    /// 创建不带 TLS 配置的端点
    pub fn new(key: EndpointKey, host: impl Into<String>) -> Self {
        Self {
            key,
            host: host.into(),
            annotations: BTreeMap::new(),
            tls: None,
            resource_version: None,
        }
    }

    /// 证书需要覆盖的域名集合
    pub fn domains(&self) -> Result<Vec<String>> {
        let host = self.host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return Err(Error::Fatal(format!("端点 {} 没有主机名", self.key)));
        }
        Ok(vec![host])
    }

    /// 检查端点能否承载控制器签发的证书
    pub fn validate_for_issuance(&self) -> Result<()> {
        self.domains()?;
        if let Some(tls) = &self.tls {
            if tls.termination.eq_ignore_ascii_case(TERMINATION_PASSTHROUGH) {
                return Err(Error::Fatal(format!(
                    "端点 {} 使用 passthrough 终止，无法注入证书",
                    self.key
                )));
            }
        }
        Ok(())
    }

    /// 当前证书链（仅在证书与私钥都存在时返回）
    pub fn certificate_pem(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .filter(|tls| tls.has_certificate())
            .and_then(|tls| tls.certificate.as_deref())
    }

    /// 写入新的证书与私钥，保留已有的终止方式与明文流量策略
    pub fn install_certificate(&mut self, certificate_pem: &str, private_key_pem: &str) {
        let tls = self.tls.get_or_insert_with(|| TlsConfig {
            termination: TERMINATION_EDGE.to_string(),
            ..Default::default()
        });
        if tls.termination.is_empty() {
            tls.termination = TERMINATION_EDGE.to_string();
        }
        tls.certificate = Some(certificate_pem.to_string());
        tls.key = Some(private_key_pem.to_string());
    }
}
