//! HTTP-01 应答服务
//!
//! 在 `/.well-known/acme-challenge/<token>` 上返回令牌表中的应答。
//! 路由层需要把各端点主机名下的该路径转发到此服务。

use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tlsacme_common::{Error, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::publisher::TokenRegistry;

/// 挑战路径前缀
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// 应答服务
pub struct ChallengeExposer {
    registry: TokenRegistry,
    addr: SocketAddr,
}

impl ChallengeExposer {
    /// 创建新的应答服务
    pub fn new(registry: TokenRegistry, addr: SocketAddr) -> Self {
        Self { registry, addr }
    }

    /// 绑定端口并在后台运行，返回实际监听地址
    pub fn spawn(self, shutdown: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        let registry = self.registry.clone();
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(handle(&registry, &req)) }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| Error::Config(format!("无法绑定挑战应答地址 {}: {}", self.addr, e)))?
            .serve(make_svc);
        let local_addr = server.local_addr();
        info!("挑战应答服务器启动在 {}", local_addr);

        let handle = tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = graceful.await {
                error!("挑战应答服务器错误: {}", e);
            }
        });
        Ok((local_addr, handle))
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}

/// 处理单个请求
pub fn handle(registry: &TokenRegistry, req: &Request<Body>) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "");
    }

    let token = match req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        Some(token) if !token.is_empty() && !token.contains('/') => token,
        _ => return respond(StatusCode::NOT_FOUND, "Not Found"),
    };

    match registry.lookup(token) {
        Some(key_authorization) => {
            debug!("应答挑战令牌 {}", token);
            respond(StatusCode::OK, key_authorization)
        }
        None => respond(StatusCode::NOT_FOUND, "Not Found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengePublisher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_of(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_published_token() {
        let registry = TokenRegistry::new();
        registry.publish("abc", "abc.thumbprint").await.unwrap();

        let response = handle(&registry, &get("/.well-known/acme-challenge/abc"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "abc.thumbprint");
    }

    #[tokio::test]
    async fn test_unknown_paths_are_not_found() {
        let registry = TokenRegistry::new();
        registry.publish("abc", "abc.thumbprint").await.unwrap();

        for path in [
            "/.well-known/acme-challenge/other",
            "/.well-known/acme-challenge/",
            "/.well-known/acme-challenge/abc/extra",
            "/abc",
        ] {
            assert_eq!(handle(&registry, &get(path)).status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_tokens_are_local_to_their_registry() {
        let owner = TokenRegistry::new();
        let other_replica = TokenRegistry::new();
        owner.publish("abc", "abc.thumbprint").await.unwrap();

        let path = "/.well-known/acme-challenge/abc";
        assert_eq!(handle(&owner, &get(path)).status(), StatusCode::OK);
        assert_eq!(handle(&other_replica, &get(path)).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_post() {
        let registry = TokenRegistry::new();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/.well-known/acme-challenge/abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(handle(&registry, &req).status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let registry = TokenRegistry::new();
        registry.publish("tok", "tok.key").await.unwrap();

        let shutdown = CancellationToken::new();
        let exposer = ChallengeExposer::new(registry, "127.0.0.1:0".parse().unwrap());
        let (addr, handle) = exposer.spawn(shutdown.clone()).unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /.well-known/acme-challenge/tok HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.ends_with("tok.key"));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
