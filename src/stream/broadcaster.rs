use crate::collectors::Sampler;
use crate::metrics::Metrics;
use crate::snapshot::Frame;
use crate::stream::registry::{Outbox, SubscriptionRegistry};
use crate::stream::{StreamError, SubscriberId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEGRADED_AFTER_FAILURES: u32 = 3;

pub type SharedHub = Arc<Mutex<Hub>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
}

// Every occupancy change and the start/stop decision it implies happen
// while this one lock is held.
pub struct Hub {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) broadcaster: Broadcaster,
    closing: bool,
    metrics: Arc<Metrics>,
    this: Weak<Mutex<Hub>>,
}

impl Hub {
    pub fn new_shared(broadcaster: Broadcaster, metrics: Arc<Metrics>) -> SharedHub {
        Arc::new_cyclic(|this| {
            Mutex::new(Hub {
                registry: SubscriptionRegistry::new(),
                broadcaster,
                closing: false,
                metrics,
                this: this.clone(),
            })
        })
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn admit(&self, id: SubscriberId) -> Result<(), StreamError> {
        if self.closing {
            return Err(StreamError::Closing(id));
        }
        if self.registry.contains(id) {
            return Err(StreamError::DuplicateSubscriber(id));
        }
        Ok(())
    }

    pub fn attach(&mut self, id: SubscriberId, outbox: Outbox) -> Result<bool, StreamError> {
        self.admit(id)?;
        let was_empty = self.registry.is_empty();
        self.registry.add(id, outbox)?;
        self.metrics.set_subscribers(self.registry.size());
        if was_empty {
            return Ok(self.broadcaster.start(self.this.clone()));
        }
        Ok(false)
    }

    // No attach succeeds after this; subscribers still registered can detach.
    pub fn close(&mut self) -> bool {
        self.closing = true;
        self.broadcaster.stop()
    }

    pub fn detach(&mut self, id: SubscriberId) -> bool {
        if !self.registry.remove(id) {
            return false;
        }
        self.metrics.set_subscribers(self.registry.size());
        if self.registry.is_empty() {
            return self.broadcaster.stop();
        }
        false
    }

    pub fn send_direct(&mut self, id: SubscriberId, frame: Frame) -> bool {
        let Some(outbox) = self.registry.outbox(id) else {
            return false;
        };
        if outbox.send(frame).is_ok() {
            self.metrics.inc_frames_sent("direct", 1);
            return true;
        }
        warn!(subscriber = %id, "не удалось отправить снимок подписчику, отключаем");
        self.metrics.inc_send_failure();
        self.detach(id);
        false
    }

    pub fn publish(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0_usize;
        let mut failed = Vec::new();
        for (id, outbox) in self.registry.iter() {
            if outbox.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                failed.push(id);
            }
        }
        self.metrics.inc_frames_sent("broadcast", delivered);

        for id in failed {
            warn!(subscriber = %id, "подписчик недоступен во время рассылки, отключаем");
            self.metrics.inc_send_failure();
            self.detach(id);
        }
        delivered
    }
}

struct CycleTask {
    cancel: watch::Sender<bool>,
    // Not awaited: the task observes `cancel` and winds down on its own.
    _handle: JoinHandle<()>,
}

pub struct Broadcaster {
    interval: Duration,
    sampler: Sampler,
    metrics: Arc<Metrics>,
    task: Option<CycleTask>,
    spawned: u64,
}

impl Broadcaster {
    pub fn new(interval: Duration, sampler: Sampler, metrics: Arc<Metrics>) -> Self {
        Self {
            interval,
            sampler,
            metrics,
            task: None,
            spawned: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        if self.task.is_some() {
            LifecycleState::Running
        } else {
            LifecycleState::Idle
        }
    }

    #[cfg(test)]
    pub fn spawned_tasks(&self) -> u64 {
        self.spawned
    }

    pub fn start(&mut self, hub: Weak<Mutex<Hub>>) -> bool {
        if self.task.is_some() {
            return false;
        }
        let (cancel, cancel_rx) = watch::channel(false);
        self.spawned += 1;
        let generation = self.spawned;
        let handle = tokio::spawn(run_cycles(
            hub,
            self.sampler.clone(),
            self.metrics.clone(),
            self.interval,
            cancel_rx,
            generation,
        ));
        self.task = Some(CycleTask {
            cancel,
            _handle: handle,
        });
        self.metrics.set_broadcaster_running(true);
        info!(generation, interval = ?self.interval, "рассылка статистики запущена");
        true
    }

    pub fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.cancel.send_replace(true);
        self.metrics.set_broadcaster_running(false);
        self.metrics.set_degraded(false);
        info!("рассылка статистики остановлена");
        true
    }
}

async fn run_cycles(
    hub: Weak<Mutex<Hub>>,
    sampler: Sampler,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
    generation: u64,
) {
    let mut consecutive_failures = 0_u32;
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if *cancel.borrow() {
            break;
        }

        let sampled = sampler.frame().await;

        let Some(hub) = hub.upgrade() else {
            break;
        };
        let mut guard = hub.lock().await;
        // stop() flips the flag under this same lock, so nothing is
        // published once it has returned.
        if *cancel.borrow() {
            break;
        }
        metrics.inc_cycle();

        match sampled {
            Ok(frame) => {
                if consecutive_failures >= DEGRADED_AFTER_FAILURES {
                    info!(generation, "сбор статистики восстановлен");
                    metrics.set_degraded(false);
                }
                consecutive_failures = 0;
                let delivered = guard.publish(&frame);
                debug!(
                    generation,
                    delivered,
                    cpu = ?frame.snapshot.cpu.perc,
                    "снимок разослан"
                );
            }
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                metrics.inc_sampling_error();
                warn!(generation, error = %err, "цикл пропущен: ошибка сбора статистики");
                if consecutive_failures == DEGRADED_AFTER_FAILURES {
                    error!(
                        generation,
                        failures = consecutive_failures,
                        "поток статистики деградировал"
                    );
                    metrics.set_degraded(true);
                }
            }
        }
    }
    debug!(generation, "цикл рассылки завершён");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::CountingProvider;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn hub_with(provider: Arc<CountingProvider>, interval_ms: u64) -> SharedHub {
        let metrics = Metrics::new().expect("инициализация метрик");
        let broadcaster = Broadcaster::new(
            Duration::from_millis(interval_ms),
            Sampler::new(provider),
            metrics.clone(),
        );
        Hub::new_shared(broadcaster, metrics)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("кадр не пришёл вовремя")
            .expect("канал закрыт")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn start_twice_spawns_one_task() {
        let provider = Arc::new(CountingProvider::default());
        let hub = hub_with(provider.clone(), 50);
        {
            let mut guard = hub.lock().await;
            let weak = Arc::downgrade(&hub);
            assert!(guard.broadcaster.start(weak.clone()));
            assert!(!guard.broadcaster.start(weak));
            assert_eq!(guard.broadcaster.spawned_tasks(), 1);
            assert_eq!(guard.broadcaster.state(), LifecycleState::Running);
        }

        sleep(Duration::from_millis(130)).await;
        // One task at 50ms gives two cycles; two tasks would give four.
        assert!(provider.calls() <= 3, "calls = {}", provider.calls());
        hub.lock().await.broadcaster.stop();
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let hub = hub_with(Arc::new(CountingProvider::default()), 10);
        let mut guard = hub.lock().await;
        assert_eq!(guard.broadcaster.state(), LifecycleState::Idle);
        assert!(!guard.broadcaster.stop());
        assert_eq!(guard.broadcaster.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn one_cycle_samples_once_and_reaches_every_subscriber() {
        let provider = Arc::new(CountingProvider::default());
        let hub = hub_with(provider.clone(), 30);
        let mut receivers = Vec::new();
        {
            let mut guard = hub.lock().await;
            for i in 0..3 {
                let (tx, rx) = mpsc::unbounded_channel();
                guard.registry.add(SubscriberId(i), tx).unwrap();
                receivers.push(rx);
            }
            guard.broadcaster.start(Arc::downgrade(&hub));
        }

        let mut first = Vec::new();
        for rx in &mut receivers {
            first.push(recv(rx).await);
        }
        hub.lock().await.broadcaster.stop();

        assert!(Arc::ptr_eq(&first[0].snapshot, &first[1].snapshot));
        assert!(Arc::ptr_eq(&first[0].snapshot, &first[2].snapshot));
        assert!(Arc::ptr_eq(&first[0].text, &first[2].text));

        let rest: Vec<Vec<Frame>> = receivers.iter_mut().map(drain).collect();
        let per_subscriber = 1 + rest[0].len();
        assert!(rest.iter().all(|r| r.len() == rest[0].len()));
        // A sample may be in flight when stop lands; it is never published.
        let calls = provider.calls();
        assert!(calls == per_subscriber || calls == per_subscriber + 1);
    }

    #[tokio::test]
    async fn no_cycle_fires_after_stop() {
        let provider = Arc::new(CountingProvider::default());
        let hub = hub_with(provider, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut guard = hub.lock().await;
            guard.attach(SubscriberId(1), tx).unwrap();
        }
        recv(&mut rx).await;

        {
            let mut guard = hub.lock().await;
            assert!(guard.broadcaster.stop());
        }
        drain(&mut rx);
        sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn send_failure_detaches_only_that_subscriber() {
        let provider = Arc::new(CountingProvider::default());
        let hub = hub_with(provider, 10);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        drop(rx_b);
        {
            let mut guard = hub.lock().await;
            guard.attach(SubscriberId(1), tx_a).unwrap();
            guard.attach(SubscriberId(2), tx_b).unwrap();
        }

        recv(&mut rx_a).await;
        let guard = hub.lock().await;
        assert!(guard.registry().contains(SubscriberId(1)));
        assert!(!guard.registry().contains(SubscriberId(2)));
        assert_eq!(guard.broadcaster().state(), LifecycleState::Running);
        drop(guard);
        hub.lock().await.broadcaster.stop();
    }

    #[tokio::test]
    async fn losing_last_subscriber_to_send_failure_stops_broadcaster() {
        let provider = Arc::new(CountingProvider::default());
        let hub = hub_with(provider.clone(), 10);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        hub.lock().await.attach(SubscriberId(1), tx).unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if hub.lock().await.broadcaster().state() == LifecycleState::Idle {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("рассылка должна остановиться");
        assert!(hub.lock().await.registry().is_empty());
    }

    #[tokio::test]
    async fn failing_cycles_are_skipped_and_loop_continues() {
        let provider = Arc::new(CountingProvider::default());
        provider.set_failing(true);
        let hub = hub_with(provider.clone(), 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.lock().await.attach(SubscriberId(1), tx).unwrap();

        sleep(Duration::from_millis(80)).await;
        assert!(provider.calls() >= DEGRADED_AFTER_FAILURES as usize);
        assert!(drain(&mut rx).is_empty());

        provider.set_failing(false);
        recv(&mut rx).await;
        hub.lock().await.detach(SubscriberId(1));
    }
}
