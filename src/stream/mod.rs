pub mod broadcaster;
pub mod registry;
pub mod session;
pub mod ws;

use crate::collectors::Sampler;
use crate::config::StreamConfig;
use crate::metrics::Metrics;
use axum::Router;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("подписчик {0} уже зарегистрирован")]
    DuplicateSubscriber(SubscriberId),
    #[error("поток статистики завершает работу, подписчик {0} не принят")]
    Closing(SubscriberId),
}

pub struct StreamManager {
    namespace: String,
    interval: Duration,
    allowed_origins: Vec<String>,
    sampler: Sampler,
    metrics: Arc<Metrics>,
    mounted: AtomicBool,
    sessions: OnceLock<Arc<SessionManager>>,
}

impl StreamManager {
    pub fn new(cfg: &StreamConfig, sampler: Sampler, metrics: Arc<Metrics>) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            interval: cfg.update_interval(),
            allowed_origins: cfg.allowed_origins.clone(),
            sampler,
            metrics,
            mounted: AtomicBool::new(false),
            sessions: OnceLock::new(),
        }
    }

    pub fn mount(&self, router: Router) -> Router {
        if self.mounted.swap(true, Ordering::SeqCst) {
            warn!(namespace = %self.namespace, "поток статистики уже смонтирован, повторный вызов пропущен");
            return router;
        }

        let sessions = Arc::new(SessionManager::new(
            self.interval,
            self.sampler.clone(),
            self.metrics.clone(),
        ));
        let _ = self.sessions.set(sessions.clone());

        info!(
            namespace = %self.namespace,
            origins = ?self.allowed_origins,
            "поток статистики смонтирован"
        );
        router.merge(ws::router(
            &self.namespace,
            ws::WsState {
                sessions,
                next_id: Arc::new(AtomicU64::new(1)),
                allowed_origins: Arc::new(self.allowed_origins.clone()),
            },
        ))
    }

    #[cfg(test)]
    pub fn sessions(&self) -> Option<Arc<SessionManager>> {
        self.sessions.get().cloned()
    }

    pub async fn shutdown(&self) {
        if let Some(sessions) = self.sessions.get() {
            sessions.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::CountingProvider;

    fn manager() -> StreamManager {
        let metrics = Metrics::new().expect("инициализация метрик");
        StreamManager::new(
            &StreamConfig::default(),
            Sampler::new(Arc::new(CountingProvider::default())),
            metrics,
        )
    }

    #[test]
    fn subscriber_id_display() {
        assert_eq!(SubscriberId(42).to_string(), "sub-42");
    }

    #[tokio::test]
    async fn mount_is_idempotent() {
        let manager = manager();
        assert!(manager.sessions().is_none());

        let router = manager.mount(Router::new());
        let first = manager.sessions().expect("менеджер сессий создан");

        let _router = manager.mount(router);
        let second = manager.sessions().expect("менеджер сессий создан");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn shutdown_before_mount_is_noop() {
        let manager = manager();
        manager.shutdown().await;
        assert!(manager.sessions().is_none());
    }
}
