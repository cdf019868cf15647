pub mod system;

use crate::snapshot::{encode_stats_update, CodecError, Frame, Snapshot};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingConfig {
    pub per_core: bool,
    pub monitored_paths: BTreeSet<String>,
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("ошибка сбора статистики: {0}")]
    Provider(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("задача сбора статистики прервана: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub trait StatsProvider: Send + Sync + 'static {
    fn sample(&self) -> Result<Snapshot, SamplingError>;
}

#[derive(Clone)]
pub struct Sampler {
    provider: Arc<dyn StatsProvider>,
}

impl Sampler {
    pub fn new(provider: Arc<dyn StatsProvider>) -> Self {
        Self { provider }
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SamplingError> {
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || provider.sample()).await?
    }

    pub async fn frame(&self) -> Result<Frame, SamplingError> {
        let snapshot = self.snapshot().await?;
        Ok(encode_stats_update(snapshot)?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::snapshot::sample_snapshot;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct CountingProvider {
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl CountingProvider {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl StatsProvider for CountingProvider {
        fn sample(&self) -> Result<Snapshot, SamplingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(SamplingError::Provider("датчик недоступен".to_string()));
            }
            let mut snapshot = sample_snapshot();
            snapshot.cpu.perc = vec![(n % 100) as f64];
            Ok(snapshot)
        }
    }
}
