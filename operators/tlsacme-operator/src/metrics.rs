//! 指标收集与导出模块
//!
//! 记录协调结果、签发次数、进行中的协调数量与队列长度，并通过 Prometheus
//! 文本格式在 `/metrics` 上导出。

use anyhow::{Context, Result};
use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tlsacme_common::ErrorKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 协调结果标签
pub fn outcome_label(kind: Option<ErrorKind>) -> &'static str {
    match kind {
        None => "success",
        Some(ErrorKind::Transient) => "transient",
        Some(ErrorKind::Conflict) => "conflict",
        Some(ErrorKind::Invalid) => "invalid",
        Some(ErrorKind::Fatal) => "fatal",
        Some(ErrorKind::Gone) => "gone",
    }
}

/// Operator 指标
pub struct Metrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 按结果统计的协调次数
    reconcile_total: IntCounterVec,
    /// 按原因统计的签发次数
    certificates_issued_total: IntCounterVec,
    /// 正在进行的协调数
    inflight_passes: IntGauge,
    /// 就绪队列长度
    queue_depth: IntGauge,
}

impl Metrics {
    /// 创建并注册全部指标
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("tlsacme_reconcile_total", "Reconcile passes by outcome"),
            &["result"],
        )?;
        let certificates_issued_total = IntCounterVec::new(
            Opts::new(
                "tlsacme_certificates_issued_total",
                "Certificates installed by reason",
            ),
            &["reason"],
        )?;
        let inflight_passes = IntGauge::new(
            "tlsacme_inflight_passes",
            "Reconcile passes currently running",
        )?;
        let queue_depth = IntGauge::new("tlsacme_queue_depth", "Keys waiting in the work queue")?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(certificates_issued_total.clone()))?;
        registry.register(Box::new(inflight_passes.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            certificates_issued_total,
            inflight_passes,
            queue_depth,
        })
    }

    /// 记录一次协调结果
    pub fn record_pass(&self, kind: Option<ErrorKind>) {
        self.reconcile_total
            .with_label_values(&[outcome_label(kind)])
            .inc();
    }

    /// 记录一次证书安装
    pub fn record_issued(&self, reason: &str) {
        self.certificates_issued_total
            .with_label_values(&[reason])
            .inc();
    }

    /// 协调开始
    pub fn pass_started(&self) {
        self.inflight_passes.inc();
    }

    /// 协调结束
    pub fn pass_finished(&self) {
        self.inflight_passes.dec();
    }

    /// 更新队列长度
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// 某个结果的累计次数
    pub fn pass_count(&self, result: &str) -> u64 {
        self.reconcile_total.with_label_values(&[result]).get()
    }

    /// 某个原因的累计签发次数
    pub fn issued_count(&self, reason: &str) -> u64 {
        self.certificates_issued_total
            .with_label_values(&[reason])
            .get()
    }

    /// 当前正在进行的协调数
    pub fn inflight(&self) -> i64 {
        self.inflight_passes.get()
    }

    /// 以文本格式导出全部指标
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("编码指标失败")?;
        String::from_utf8(buffer).context("指标不是有效的 UTF-8")
    }
}

async fn serve_request(metrics: Arc<Metrics>, req: Request<Body>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    if req.uri().path() != "/metrics" {
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }
    match metrics.render() {
        Ok(text) => {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            *response.body_mut() = Body::from(text);
        }
        Err(e) => {
            error!("导出指标失败: {:#}", e);
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    response
}

/// 启动指标服务器，返回实际监听地址
pub fn spawn_server(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(serve_request(metrics, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("无法绑定指标地址 {}", addr))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!("指标服务器启动在 {}", local_addr);

    let handle = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = graceful.await {
            error!("指标服务器错误: {}", e);
        }
    });
    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_pass(None);
        metrics.record_pass(Some(ErrorKind::Conflict));
        metrics.record_issued("issuance");
        metrics.set_queue_depth(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("tlsacme_reconcile_total{result=\"success\"} 1"));
        assert!(text.contains("tlsacme_reconcile_total{result=\"conflict\"} 1"));
        assert!(text.contains("tlsacme_certificates_issued_total{reason=\"issuance\"} 1"));
        assert!(text.contains("tlsacme_queue_depth 3"));
    }

    #[tokio::test]
    async fn test_serve_request() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.pass_started();

        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let response = serve_request(metrics.clone(), req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("tlsacme_inflight_passes 1"));

        let req = Request::get("/other").body(Body::empty()).unwrap();
        assert_eq!(serve_request(metrics, req).await.status(), StatusCode::NOT_FOUND);
    }
}
