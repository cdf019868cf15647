use crate::collectors::Sampler;
use crate::metrics::Metrics;
use crate::stream::broadcaster::{Broadcaster, Hub, SharedHub};
use crate::stream::registry::Outbox;
use crate::stream::{StreamError, SubscriberId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use crate::stream::broadcaster::LifecycleState;

pub struct SessionManager {
    hub: SharedHub,
    sampler: Sampler,
}

impl SessionManager {
    pub fn new(interval: Duration, sampler: Sampler, metrics: Arc<Metrics>) -> Self {
        let broadcaster = Broadcaster::new(interval, sampler.clone(), metrics.clone());
        Self {
            hub: Hub::new_shared(broadcaster, metrics),
            sampler,
        }
    }

    pub async fn on_attach(&self, id: SubscriberId, outbox: Outbox) -> Result<(), StreamError> {
        let admitted = self.hub.lock().await.admit(id);
        if let Err(err) = admitted {
            log_rejected(id, &err);
            return Err(err);
        }

        // The greeting is sampled before registering on purpose: it then lands
        // in the outbox ahead of any broadcast frame.
        let greeting = self.sampler.frame().await;

        let mut hub = self.hub.lock().await;
        let started = match hub.attach(id, outbox) {
            Ok(started) => started,
            Err(err) => {
                log_rejected(id, &err);
                return Err(err);
            }
        };
        info!(
            subscriber = %id,
            subscribers = hub.registry().size(),
            started,
            state = ?hub.broadcaster().state(),
            "подписчик подключён"
        );

        match greeting {
            Ok(frame) => {
                hub.send_direct(id, frame);
            }
            Err(err) => {
                warn!(subscriber = %id, error = %err, "не удалось собрать начальный снимок");
            }
        }
        Ok(())
    }

    pub async fn on_detach(&self, id: SubscriberId) {
        let mut hub = self.hub.lock().await;
        let stopped = hub.detach(id);
        info!(
            subscriber = %id,
            subscribers = hub.registry().size(),
            stopped,
            state = ?hub.broadcaster().state(),
            "подписчик отключён"
        );
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.hub.lock().await.registry().size()
    }

    #[cfg(test)]
    pub async fn lifecycle(&self) -> LifecycleState {
        self.hub.lock().await.broadcaster().state()
    }

    #[cfg(test)]
    pub async fn spawned_tasks(&self) -> u64 {
        self.hub.lock().await.broadcaster().spawned_tasks()
    }

    pub async fn shutdown(&self) {
        let mut hub = self.hub.lock().await;
        let stopped = hub.close();
        info!(
            subscribers = hub.registry().size(),
            stopped,
            "поток статистики закрыт для новых подписчиков"
        );
    }
}

fn log_rejected(id: SubscriberId, err: &StreamError) {
    match err {
        StreamError::DuplicateSubscriber(_) => {
            error!(subscriber = %id, error = %err, "нарушен инвариант реестра подписчиков");
        }
        StreamError::Closing(_) => {
            debug!(subscriber = %id, "подключение отклонено: идёт завершение работы");
        }
    }
}
