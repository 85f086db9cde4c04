//! Kubernetes 存储实现
//!
//! 端点存储读写 Route，账户存储读写 Secret。所有 Kubernetes API 错误按状态码
//! 归入统一的错误类别：409 为版本冲突，404 为资源已删除，其余视为瞬时错误。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tlsacme_common::{Endpoint, EndpointKey, Error, Result};
use tlsacme_controller::acme::AccountStatus;
use tlsacme_controller::{AccountScope, AccountStore, AcmeAccount, EndpointStore};
use tracing::{debug, warn};

use crate::crd::{endpoint_patch, route_to_endpoint, Route};

/// 字段管理者名称
pub const FIELD_MANAGER: &str = "tlsacme-operator";

const SECRET_URL_KEY: &str = "url";
const SECRET_CREDENTIALS_KEY: &str = "credentials";
const SECRET_CONTACT_KEY: &str = "contact";
const SECRET_STATUS_KEY: &str = "status";
const SECRET_CREATED_AT_KEY: &str = "created-at";

/// 把 Kubernetes API 错误归类
pub fn classify(err: kube::Error, what: &str) -> Error {
    match &err {
        kube::Error::Api(response) => match response.code {
            409 => Error::Conflict(format!("{}: {}", what, response.message)),
            404 => Error::Gone(format!("{}: {}", what, response.message)),
            400 | 422 => Error::Fatal(format!("{}: {}", what, response.message)),
            _ => Error::Transient(format!("{}: {}", what, err)),
        },
        _ => Error::Transient(format!("{}: {}", what, err)),
    }
}

/// 基于 Route 的端点存储
#[derive(Clone)]
pub struct KubeEndpointStore {
    client: Client,
    /// 监听的命名空间，为空表示全部
    namespaces: Vec<String>,
}

impl KubeEndpointStore {
    /// 创建新的端点存储
    pub fn new(client: Client, namespaces: Vec<String>) -> Self {
        Self { client, namespaces }
    }

    fn api(&self, namespace: &str) -> Api<Route> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn convert(routes: Vec<Route>) -> Vec<Endpoint> {
        routes
            .iter()
            .filter_map(|route| match route_to_endpoint(route) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!("跳过无法转换的 Route: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl EndpointStore for KubeEndpointStore {
    async fn list(&self) -> Result<Vec<Endpoint>> {
        if self.namespaces.is_empty() {
            let api: Api<Route> = Api::all(self.client.clone());
            let routes = api
                .list(&ListParams::default())
                .await
                .map_err(|e| classify(e, "列出 Route"))?;
            return Ok(Self::convert(routes.items));
        }

        let mut endpoints = Vec::new();
        for namespace in &self.namespaces {
            let routes = self
                .api(namespace)
                .list(&ListParams::default())
                .await
                .map_err(|e| classify(e, &format!("列出命名空间 {} 的 Route", namespace)))?;
            endpoints.extend(Self::convert(routes.items));
        }
        Ok(endpoints)
    }

    async fn get(&self, key: &EndpointKey) -> Result<Option<Endpoint>> {
        let route = self
            .api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, &format!("读取 Route {}", key)))?;
        route.as_ref().map(route_to_endpoint).transpose()
    }

    async fn update(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let key = &endpoint.key;
        let patch = endpoint_patch(endpoint);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let route = self
            .api(&key.namespace)
            .patch(&key.name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &format!("更新 Route {}", key)))?;
        debug!(
            "Route {} 已更新，资源版本 {:?}",
            key,
            route.metadata.resource_version
        );
        route_to_endpoint(&route)
    }
}

/// 基于 Secret 的账户存储
#[derive(Clone)]
pub struct SecretAccountStore {
    client: Client,
}

impl SecretAccountStore {
    /// 创建新的账户存储
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// 把账户序列化为 Secret
pub fn account_to_secret(account: &AcmeAccount) -> Result<Secret> {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        data.insert(key.to_string(), ByteString(value.into_bytes()));
    };
    put(SECRET_URL_KEY, account.url.clone());
    put(SECRET_CREDENTIALS_KEY, account.credentials.clone());
    put(SECRET_CONTACT_KEY, serde_json::to_string(&account.contact)?);
    put(SECRET_STATUS_KEY, account.status.as_str().to_string());
    put(SECRET_CREATED_AT_KEY, account.created_at.to_rfc3339());

    let labels = BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    )]);
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(account.scope.name.clone()),
            namespace: Some(account.scope.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// 从 Secret 解析账户
pub fn secret_to_account(scope: &AccountScope, secret: &Secret) -> Result<AcmeAccount> {
    let data = secret.data.clone().unwrap_or_default();
    let field = |key: &str| -> Result<String> {
        let bytes = data
            .get(key)
            .ok_or_else(|| Error::Fatal(format!("账户 Secret {} 缺少字段 {}", scope, key)))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|_| Error::Fatal(format!("账户 Secret {} 的字段 {} 不是 UTF-8", scope, key)))
    };

    let contact = match data.get(SECRET_CONTACT_KEY) {
        Some(raw) => serde_json::from_slice(&raw.0)?,
        None => Vec::new(),
    };
    let status = match data.get(SECRET_STATUS_KEY) {
        Some(_) => field(SECRET_STATUS_KEY)?.parse::<AccountStatus>()?,
        None => AccountStatus::Active,
    };
    let created_at = match data.get(SECRET_CREATED_AT_KEY) {
        Some(_) => DateTime::parse_from_rfc3339(&field(SECRET_CREATED_AT_KEY)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Fatal(format!("账户 Secret {} 的创建时间无效: {}", scope, e)))?,
        None => secret
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
    };

    Ok(AcmeAccount {
        scope: scope.clone(),
        url: field(SECRET_URL_KEY)?,
        contact,
        credentials: field(SECRET_CREDENTIALS_KEY)?,
        status,
        created_at,
    })
}

#[async_trait]
impl AccountStore for SecretAccountStore {
    async fn get(&self, scope: &AccountScope) -> Result<Option<AcmeAccount>> {
        let secret = self
            .api(&scope.namespace)
            .get_opt(&scope.name)
            .await
            .map_err(|e| classify(e, &format!("读取账户 Secret {}", scope)))?;
        secret.map(|s| secret_to_account(scope, &s)).transpose()
    }

    async fn create(&self, account: &AcmeAccount) -> Result<()> {
        let secret = account_to_secret(account)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&account.scope.namespace)
            .create(&params, &secret)
            .await
            .map_err(|e| classify(e, &format!("创建账户 Secret {}", account.scope)))?;
        Ok(())
    }

    async fn delete(&self, scope: &AccountScope) -> Result<()> {
        match self
            .api(&scope.namespace)
            .delete(&scope.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(classify(e, &format!("删除账户 Secret {}", scope))),
        }
    }
}
