//! Route 资源定义模块
//!
//! 该模块声明 OpenShift Route（route.openshift.io/v1）的客户端类型，并负责在 Route
//! 与控制器内部的端点快照之间转换。Route 由集群提供，Operator 不注册 CRD，
//! 因此这里关闭了 schema 生成；未识别的字段原样保留。

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tlsacme_common::{managed_lock_keys, Endpoint, EndpointKey, Error, Result, TlsConfig};

/// Route 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// 对外主机名
    #[serde(default)]
    pub host: String,

    /// 路径前缀
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// 后端服务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RouteTargetReference>,

    /// TLS 配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,

    /// 其余字段（port、wildcardPolicy 等）
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// 后端引用
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    /// 资源类型，通常为 Service
    #[serde(default)]
    pub kind: String,
    /// 资源名称
    pub name: String,
    /// 权重
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Route 的 TLS 配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    /// 终止方式
    #[serde(default)]
    pub termination: String,
    /// 证书链
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// 私钥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// CA 证书
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    /// 重新加密时的后端 CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ca_certificate: Option<String>,
    /// 明文流量策略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
}

impl From<&RouteTls> for TlsConfig {
    fn from(tls: &RouteTls) -> Self {
        TlsConfig {
            termination: tls.termination.clone(),
            certificate: tls.certificate.clone(),
            key: tls.key.clone(),
            insecure_edge_termination_policy: tls.insecure_edge_termination_policy.clone(),
        }
    }
}

/// Route 的端点标识
pub fn route_key(route: &Route) -> Result<EndpointKey> {
    let namespace = route
        .namespace()
        .ok_or_else(|| Error::Fatal(format!("Route {} 没有命名空间", route.name_any())))?;
    Ok(EndpointKey::new(namespace, route.name_any()))
}

/// 把 Route 转换为端点快照
pub fn route_to_endpoint(route: &Route) -> Result<Endpoint> {
    Ok(Endpoint {
        key: route_key(route)?,
        host: route.spec.host.clone(),
        annotations: route.annotations().clone(),
        tls: route.spec.tls.as_ref().map(TlsConfig::from),
        resource_version: route.resource_version(),
    })
}

/// 构造把端点写回 Route 的合并补丁
///
/// 补丁携带 `metadata.resourceVersion`，API Server 据此拒绝基于过期快照的写入。
/// 租约注解缺失时显式置为 null 以删除；TLS 只写控制器管理的字段，
/// CA 等其余字段保持不变。
pub fn endpoint_patch(endpoint: &Endpoint) -> Value {
    let mut annotations = Map::new();
    for (k, v) in &endpoint.annotations {
        annotations.insert(k.clone(), Value::String(v.clone()));
    }
    for key in managed_lock_keys() {
        annotations.entry(key.to_string()).or_insert(Value::Null);
    }

    let mut patch = json!({
        "metadata": {
            "annotations": annotations,
        }
    });
    if let Some(version) = &endpoint.resource_version {
        patch["metadata"]["resourceVersion"] = Value::String(version.clone());
    }
    if let Some(tls) = &endpoint.tls {
        let mut fields = Map::new();
        fields.insert("termination".into(), Value::String(tls.termination.clone()));
        let optional = [
            ("certificate", &tls.certificate),
            ("key", &tls.key),
            ("insecureEdgeTerminationPolicy", &tls.insecure_edge_termination_policy),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.insert(name.into(), Value::String(value.clone()));
            }
        }
        patch["spec"] = json!({ "tls": fields });
    }
    patch
}
