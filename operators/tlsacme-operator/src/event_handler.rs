//! 事件处理模块
//!
//! 监听 Route 的变化并转交给控制器：新增或修改的端点入队，删除的端点取消
//! 进行中的协调，监听重建时全量入队。只关心启用了自动 TLS 或仍带有租约的端点。

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tlsacme_common::{decode_lock, is_tls_acme_enabled, EndpointKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::crd::{route_key, Route};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// 资源新增或修改
    Applied,
    /// 资源删除
    Deleted,
    /// 监听重建后的全量列举
    Restarted,
}

/// 事件结构体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// 事件类型
    pub event_type: EventType,
    /// 端点标识
    pub key: EndpointKey,
    /// 是否需要控制器处理
    pub relevant: bool,
}

fn is_relevant(route: &Route) -> bool {
    let annotations = route.annotations();
    is_tls_acme_enabled(annotations) || decode_lock(annotations).is_some()
}

fn to_event(event_type: EventType, route: &Route) -> Option<Event> {
    match route_key(route) {
        Ok(key) => Some(Event {
            event_type,
            key,
            relevant: is_relevant(route),
        }),
        Err(e) => {
            warn!("忽略无法识别的 Route: {}", e);
            None
        }
    }
}

/// 把监听事件转换为控制器事件
pub fn translate(event: watcher::Event<Route>) -> Vec<Event> {
    match event {
        watcher::Event::Applied(route) => to_event(EventType::Applied, &route).into_iter().collect(),
        watcher::Event::Deleted(route) => to_event(EventType::Deleted, &route).into_iter().collect(),
        watcher::Event::Restarted(routes) => routes
            .iter()
            .filter_map(|route| to_event(EventType::Restarted, route))
            .collect(),
    }
}

/// 把事件交给控制器
pub fn dispatch(controller: &Controller, event: Event) {
    match event.event_type {
        EventType::Deleted => controller.forget(&event.key),
        EventType::Applied | EventType::Restarted if event.relevant => controller.enqueue(event.key),
        _ => debug!("忽略未启用自动 TLS 的端点 {}", event.key),
    }
}

/// 事件处理器结构体
pub struct EventHandler {
    /// Kubernetes 客户端
    client: Client,
    /// 监听的命名空间，为空表示全部
    namespaces: Vec<String>,
    /// 控制器
    controller: Arc<Controller>,
    /// 关闭信号
    shutdown: CancellationToken,
}

impl EventHandler {
    /// 创建新的事件处理器
    pub fn new(client: Client, namespaces: Vec<String>, controller: Arc<Controller>) -> Self {
        Self {
            client,
            namespaces,
            controller,
            shutdown: CancellationToken::new(),
        }
    }

    /// 为每个命名空间（或整个集群）启动一个监听器
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.namespaces.is_empty() {
            let api: Api<Route> = Api::all(self.client.clone());
            return vec![self.spawn_watcher(api, "全部命名空间".to_string())];
        }
        self.namespaces
            .iter()
            .map(|ns| {
                let api: Api<Route> = Api::namespaced(self.client.clone(), ns);
                self.spawn_watcher(api, ns.clone())
            })
            .collect()
    }

    /// 停止全部监听器
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn spawn_watcher(&self, api: Api<Route>, scope: String) -> JoinHandle<()> {
        let controller = self.controller.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            info!("启动 Route 监听器: {}", scope);
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            for event in translate(event) {
                                dispatch(&controller, event);
                            }
                        }
                        Some(Err(e)) => warn!("Route 监听器错误（{}）: {}", scope, e),
                        None => break,
                    }
                }
            }
            info!("Route 监听器已退出: {}", scope);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RouteSpec;
    use std::collections::BTreeMap;
    use tlsacme_common::TLS_ACME_ANNOTATION;

    fn route(name: &str, enabled: bool) -> Route {
        let mut route = Route::new(
            name,
            RouteSpec {
                host: format!("{}.example.com", name),
                ..Default::default()
            },
        );
        route.metadata.namespace = Some("shop".into());
        if enabled {
            route.metadata.annotations = Some(BTreeMap::from([(
                TLS_ACME_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        route
    }

    #[test]
    fn test_translate_applied_and_deleted() {
        let events = translate(watcher::Event::Applied(route("web", true)));
        assert_eq!(
            events,
            vec![Event {
                event_type: EventType::Applied,
                key: EndpointKey::new("shop", "web"),
                relevant: true,
            }]
        );

        let events = translate(watcher::Event::Deleted(route("web", false)));
        assert_eq!(events[0].event_type, EventType::Deleted);
        assert!(!events[0].relevant);
    }

    #[test]
    fn test_translate_restart_lists_all() {
        let events = translate(watcher::Event::Restarted(vec![
            route("a", true),
            route("b", false),
        ]));
        assert_eq!(events.len(), 2);
        assert!(events[0].relevant);
        assert!(!events[1].relevant);
    }

    #[test]
    fn test_route_without_namespace_is_skipped() {
        let mut r = route("web", true);
        r.metadata.namespace = None;
        assert!(translate(watcher::Event::Applied(r)).is_empty());
    }
}
