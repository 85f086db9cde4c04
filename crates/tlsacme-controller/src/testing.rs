//! 测试用内存实现
//!
//! 内存端点存储遵循与真实对象存储相同的条件写入语义；假 ACME 客户端用 rcgen
//! 签发真实可解析的证书，并在挑战应答时检查令牌表是否真的发布了应答。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tlsacme_common::{CertificateBundle, Endpoint, EndpointKey, Error, Result};

use crate::acme::{
    AccountScope, AcmeAccount, AcmeClient, AuthorizationState, AuthorizationStatus, ChallengeInfo,
    ChallengeKind, OrderHandle, OrderStatus, RegisteredAccount,
};
use crate::challenge::TokenRegistry;
use crate::store::{AccountStore, EndpointStore};

fn to_offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).expect("时间戳超出范围")
}

/// 生成覆盖指定域名的自签名证书
pub fn self_signed_certificate(
    domains: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> CertificateBundle {
    let key = KeyPair::generate().expect("生成密钥失败");
    let mut params = CertificateParams::new(domains.to_vec()).expect("无效的域名");
    params.distinguished_name = DistinguishedName::new();
    params.not_before = to_offset(not_before);
    params.not_after = to_offset(not_after);
    let cert = params.self_signed(&key).expect("签发证书失败");
    CertificateBundle {
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
    }
}

/// 内存端点存储
#[derive(Default)]
pub struct InMemoryEndpointStore {
    inner: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    endpoints: BTreeMap<EndpointKey, Endpoint>,
    next_version: u64,
    updates: usize,
}

impl EndpointState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

impl InMemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入端点（模拟用户创建或修改），返回带新资源版本的快照
    pub fn insert(&self, mut endpoint: Endpoint) -> Endpoint {
        let mut state = self.inner.lock().expect("存储锁已中毒");
        endpoint.resource_version = Some(state.bump());
        state.endpoints.insert(endpoint.key.clone(), endpoint.clone());
        endpoint
    }

    /// 删除端点
    pub fn remove(&self, key: &EndpointKey) -> Option<Endpoint> {
        self.inner.lock().expect("存储锁已中毒").endpoints.remove(key)
    }

    /// 读取当前快照
    pub fn snapshot(&self, key: &EndpointKey) -> Option<Endpoint> {
        self.inner
            .lock()
            .expect("存储锁已中毒")
            .endpoints
            .get(key)
            .cloned()
    }

    /// 成功的条件写入次数
    pub fn update_count(&self) -> usize {
        self.inner.lock().expect("存储锁已中毒").updates
    }
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
    async fn list(&self) -> Result<Vec<Endpoint>> {
        Ok(self
            .inner
            .lock()
            .expect("存储锁已中毒")
            .endpoints
            .values()
            .cloned()
            .collect())
    }

    async fn get(&self, key: &EndpointKey) -> Result<Option<Endpoint>> {
        Ok(self.snapshot(key))
    }

    async fn update(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let mut state = self.inner.lock().expect("存储锁已中毒");
        let current = state
            .endpoints
            .get(&endpoint.key)
            .ok_or_else(|| Error::Gone(endpoint.key.to_string()))?;
        if current.resource_version != endpoint.resource_version {
            return Err(Error::Conflict(format!(
                "{}: 期望版本 {:?}，实际版本 {:?}",
                endpoint.key, endpoint.resource_version, current.resource_version
            )));
        }
        let mut updated = endpoint.clone();
        updated.resource_version = Some(state.bump());
        state.endpoints.insert(updated.key.clone(), updated.clone());
        state.updates += 1;
        Ok(updated)
    }
}

/// 内存账户存储
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<AccountScope, AcmeAccount>>,
    racing_winner: Mutex<Option<AcmeAccount>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一次创建前先写入另一个实例的账户，模拟并发创建冲突
    pub fn fail_next_create_with_conflict(&self, winner: AcmeAccount) {
        *self.racing_winner.lock().expect("存储锁已中毒") = Some(winner);
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, scope: &AccountScope) -> Result<Option<AcmeAccount>> {
        Ok(self.accounts.lock().expect("存储锁已中毒").get(scope).cloned())
    }

    async fn create(&self, account: &AcmeAccount) -> Result<()> {
        let mut accounts = self.accounts.lock().expect("存储锁已中毒");
        if let Some(winner) = self.racing_winner.lock().expect("存储锁已中毒").take() {
            accounts.insert(winner.scope.clone(), winner);
        }
        if accounts.contains_key(&account.scope) {
            return Err(Error::Conflict(format!("账户 {} 已存在", account.scope)));
        }
        accounts.insert(account.scope.clone(), account.clone());
        Ok(())
    }

    async fn delete(&self, scope: &AccountScope) -> Result<()> {
        self.accounts.lock().expect("存储锁已中毒").remove(scope);
        Ok(())
    }
}

/// 假 ACME 服务端对授权的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// 应答正确时通过
    Valid,
    /// 总是拒绝
    Invalid,
    /// 永远等待
    Pending,
}

struct FakeAuthorization {
    url: String,
    domain: String,
    token: String,
    challenge_url: String,
    /// 应答时令牌表是否返回了正确内容，None 表示尚未应答
    served: Option<bool>,
}

impl FakeAuthorization {
    /// 按当前判定计算状态，改变判定会影响尚在等待的授权
    fn status(&self, outcome: AuthorizationOutcome) -> AuthorizationStatus {
        match (self.served, outcome) {
            (None, _) | (Some(_), AuthorizationOutcome::Pending) => AuthorizationStatus::Pending,
            (Some(true), AuthorizationOutcome::Valid) => AuthorizationStatus::Valid,
            (Some(_), _) => AuthorizationStatus::Invalid,
        }
    }
}

struct FakeOrder {
    domains: Vec<String>,
    status: OrderStatus,
    authorizations: Vec<FakeAuthorization>,
    certificate: Option<String>,
}

struct FakeState {
    outcome: AuthorizationOutcome,
    offer_http01: bool,
    fail_deactivation: bool,
    fail_orders: bool,
    registrations: usize,
    deactivated: Vec<String>,
    responded: usize,
    next_order: u64,
    orders: HashMap<String, FakeOrder>,
    validity: Duration,
}

/// 假 ACME 客户端
pub struct FakeAcmeClient {
    state: Mutex<FakeState>,
    registry: Option<TokenRegistry>,
}

impl Default for FakeAcmeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAcmeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                outcome: AuthorizationOutcome::Valid,
                offer_http01: true,
                fail_deactivation: false,
                fail_orders: false,
                registrations: 0,
                deactivated: Vec::new(),
                responded: 0,
                next_order: 0,
                orders: HashMap::new(),
                validity: Duration::days(90),
            }),
            registry: None,
        }
    }

    /// 应答时检查令牌表，未发布正确应答的授权将失败
    pub fn with_registry(mut self, registry: TokenRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("假 ACME 状态锁已中毒")
    }

    pub fn set_outcome(&self, outcome: AuthorizationOutcome) {
        self.state().outcome = outcome;
    }

    pub fn set_offer_http01(&self, offer: bool) {
        self.state().offer_http01 = offer;
    }

    pub fn fail_deactivation(&self, fail: bool) {
        self.state().fail_deactivation = fail;
    }

    /// 创建订单时返回瞬时错误
    pub fn fail_orders(&self, fail: bool) {
        self.state().fail_orders = fail;
    }

    /// 签发证书的有效期
    pub fn set_validity(&self, validity: Duration) {
        self.state().validity = validity;
    }

    pub fn registrations(&self) -> usize {
        self.state().registrations
    }

    pub fn deactivated(&self) -> Vec<String> {
        self.state().deactivated.clone()
    }

    pub fn responded(&self) -> usize {
        self.state().responded
    }

    pub fn orders_created(&self) -> u64 {
        self.state().next_order
    }

    fn key_authorization(token: &str) -> String {
        format!("{}.thumbprint", token)
    }
}

#[async_trait]
impl AcmeClient for FakeAcmeClient {
    async fn register_account(&self, _contact: &[String]) -> Result<RegisteredAccount> {
        let mut state = self.state();
        state.registrations += 1;
        Ok(RegisteredAccount {
            url: format!("https://acme.test/acct/{}", state.registrations),
            credentials: "{}".to_string(),
        })
    }

    async fn deactivate_account(&self, account: &AcmeAccount) -> Result<()> {
        let mut state = self.state();
        if state.fail_deactivation {
            return Err(Error::Transient("ACME 服务不可用".to_string()));
        }
        state.deactivated.push(account.url.clone());
        Ok(())
    }

    async fn create_order(&self, _account: &AcmeAccount, domains: &[String]) -> Result<OrderHandle> {
        let mut state = self.state();
        if state.fail_orders {
            return Err(Error::Transient("ACME 服务返回 503".to_string()));
        }
        state.next_order += 1;
        let id = state.next_order;
        let url = format!("https://acme.test/order/{}", id);
        let authorizations = domains
            .iter()
            .enumerate()
            .map(|(i, domain)| FakeAuthorization {
                url: format!("https://acme.test/authz/{}-{}", id, i),
                domain: domain.clone(),
                token: format!("token-{}-{}", id, i),
                challenge_url: format!("https://acme.test/chall/{}-{}", id, i),
                served: None,
            })
            .collect::<Vec<_>>();
        let handle = OrderHandle {
            url: url.clone(),
            status: OrderStatus::Pending,
            authorizations: authorizations.iter().map(|a| a.url.clone()).collect(),
        };
        state.orders.insert(
            url,
            FakeOrder {
                domains: domains.to_vec(),
                status: OrderStatus::Pending,
                authorizations,
                certificate: None,
            },
        );
        Ok(handle)
    }

    async fn get_authorization(
        &self,
        _account: &AcmeAccount,
        order_url: &str,
        authorization_url: &str,
    ) -> Result<AuthorizationState> {
        let state = self.state();
        let offer_http01 = state.offer_http01;
        let outcome = state.outcome;
        let authz = state
            .orders
            .get(order_url)
            .and_then(|o| o.authorizations.iter().find(|a| a.url == authorization_url))
            .ok_or_else(|| Error::Invalid(format!("授权不存在: {}", authorization_url)))?;

        let mut challenges = vec![ChallengeInfo {
            kind: ChallengeKind::Dns01,
            url: format!("{}/dns", authz.challenge_url),
            token: format!("{}-dns", authz.token),
            key_authorization: Self::key_authorization(&authz.token),
        }];
        if offer_http01 {
            challenges.push(ChallengeInfo {
                kind: ChallengeKind::Http01,
                url: authz.challenge_url.clone(),
                token: authz.token.clone(),
                key_authorization: Self::key_authorization(&authz.token),
            });
        }

        Ok(AuthorizationState {
            url: authz.url.clone(),
            domain: authz.domain.clone(),
            status: authz.status(outcome),
            challenges,
            expires: None,
        })
    }

    async fn respond_to_challenge(
        &self,
        _account: &AcmeAccount,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<()> {
        let mut state = self.state();
        state.responded += 1;
        let authz = state
            .orders
            .get_mut(order_url)
            .and_then(|o| {
                o.authorizations
                    .iter_mut()
                    .find(|a| a.challenge_url == challenge_url)
            })
            .ok_or_else(|| Error::Invalid(format!("挑战不存在: {}", challenge_url)))?;

        let served = match &self.registry {
            Some(registry) => {
                registry.lookup(&authz.token) == Some(Self::key_authorization(&authz.token))
            }
            None => true,
        };
        authz.served = Some(served);
        Ok(())
    }

    async fn poll_order(&self, _account: &AcmeAccount, order_url: &str) -> Result<OrderHandle> {
        let mut state = self.state();
        let outcome = state.outcome;
        let order = state
            .orders
            .get_mut(order_url)
            .ok_or_else(|| Error::Invalid(format!("订单不存在: {}", order_url)))?;

        if order.status == OrderStatus::Pending {
            if order
                .authorizations
                .iter()
                .any(|a| a.status(outcome).is_failed())
            {
                order.status = OrderStatus::Invalid;
            } else if order
                .authorizations
                .iter()
                .all(|a| a.status(outcome) == AuthorizationStatus::Valid)
            {
                order.status = OrderStatus::Ready;
            }
        }
        Ok(OrderHandle {
            url: order_url.to_string(),
            status: order.status,
            authorizations: order.authorizations.iter().map(|a| a.url.clone()).collect(),
        })
    }

    async fn finalize_order(
        &self,
        _account: &AcmeAccount,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderHandle> {
        let mut state = self.state();
        let validity = state.validity;
        let order = state
            .orders
            .get_mut(order_url)
            .ok_or_else(|| Error::Invalid(format!("订单不存在: {}", order_url)))?;
        if order.status != OrderStatus::Ready || csr_der.is_empty() {
            return Err(Error::Invalid(format!("订单 {} 尚未就绪", order_url)));
        }

        let now = Utc::now();
        let bundle = self_signed_certificate(&order.domains, now - Duration::hours(1), now + validity);
        order.certificate = Some(bundle.certificate_pem);
        order.status = OrderStatus::Valid;
        Ok(OrderHandle {
            url: order_url.to_string(),
            status: order.status,
            authorizations: order.authorizations.iter().map(|a| a.url.clone()).collect(),
        })
    }

    async fn download_certificate(
        &self,
        _account: &AcmeAccount,
        order_url: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .state()
            .orders
            .get(order_url)
            .and_then(|o| o.certificate.clone()))
    }
}
