use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub stream_subscribers: Gauge,
    pub broadcaster_running: Gauge,
    pub stream_degraded: Gauge,
    pub broadcast_cycles_total: Counter,
    pub frames_sent_total: CounterVec,
    pub sampling_errors_total: Counter,
    pub send_failures_total: Counter,
    pub scrape_count_total: Counter,
    pub uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let stream_subscribers = Gauge::with_opts(opts!(
            "sysmond_stream_subscribers",
            "Number of clients attached to the stats stream"
        ))?;
        let broadcaster_running = Gauge::with_opts(opts!(
            "sysmond_broadcaster_running",
            "1 while the periodic stats broadcaster is running"
        ))?;
        let stream_degraded = Gauge::with_opts(opts!(
            "sysmond_stream_degraded",
            "1 after three or more consecutive failed broadcast cycles"
        ))?;
        let broadcast_cycles_total = Counter::with_opts(opts!(
            "sysmond_broadcast_cycles_total",
            "Completed broadcast cycles, successful or not"
        ))?;
        let frames_sent_total = CounterVec::new(
            opts!(
                "sysmond_frames_sent_total",
                "Snapshots queued to subscribers by kind (direct, broadcast)"
            ),
            &["kind"],
        )?;
        let sampling_errors_total = Counter::with_opts(opts!(
            "sysmond_sampling_errors_total",
            "Broadcast cycles skipped because sampling or encoding failed"
        ))?;
        let send_failures_total = Counter::with_opts(opts!(
            "sysmond_send_failures_total",
            "Subscribers dropped because a push to them failed"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "sysmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let uptime_seconds = Gauge::with_opts(opts!(
            "sysmond_uptime_seconds",
            "Seconds since the daemon started"
        ))?;

        register(&registry, &stream_subscribers)?;
        register(&registry, &broadcaster_running)?;
        register(&registry, &stream_degraded)?;
        register(&registry, &broadcast_cycles_total)?;
        register(&registry, &frames_sent_total)?;
        register(&registry, &sampling_errors_total)?;
        register(&registry, &send_failures_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            stream_subscribers,
            broadcaster_running,
            stream_degraded,
            broadcast_cycles_total,
            frames_sent_total,
            sampling_errors_total,
            send_failures_total,
            scrape_count_total,
            uptime_seconds,
        }))
    }

    pub fn set_subscribers(&self, count: usize) {
        self.stream_subscribers.set(count as f64);
    }

    pub fn set_broadcaster_running(&self, running: bool) {
        self.broadcaster_running.set(if running { 1.0 } else { 0.0 });
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.stream_degraded.set(if degraded { 1.0 } else { 0.0 });
    }

    pub fn inc_cycle(&self) {
        self.broadcast_cycles_total.inc();
    }

    pub fn inc_frames_sent(&self, kind: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.frames_sent_total
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }

    pub fn inc_sampling_error(&self) {
        self.sampling_errors_total.inc();
    }

    pub fn inc_send_failure(&self) {
        self.send_failures_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.uptime_seconds
            .set(now_unix().saturating_sub(self.started_at_unix) as f64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
