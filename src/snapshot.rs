use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub const STATS_UPDATE_EVENT: &str = "stats_update";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub system: SystemInfo,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: BTreeMap<String, DiskUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub model: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub freq: Vec<CpuFreq>,
    pub perc: Vec<f64>,
    pub temp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuFreq {
    pub current: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(rename = "virtual")]
    pub virtual_mem: VirtualMemory,
    pub swap: SwapMemory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
    pub available: u64,
    pub active: u64,
    pub inactive: u64,
    pub buffers: u64,
    pub cached: u64,
    pub shared: u64,
    pub slab: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
    pub sin: u64,
    pub sout: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("снимок не прошёл проверку: {0}")]
    Invalid(String),
    #[error("не удалось сериализовать снимок: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Snapshot {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.cpu.freq.is_empty() {
            return Err(CodecError::Invalid("cpu.freq пуст".to_string()));
        }
        if self.cpu.perc.is_empty() {
            return Err(CodecError::Invalid("cpu.perc пуст".to_string()));
        }
        for (i, f) in self.cpu.freq.iter().enumerate() {
            if ![f.current, f.min, f.max].iter().all(|v| v.is_finite() && *v >= 0.0) {
                return Err(CodecError::Invalid(format!(
                    "cpu.freq[{i}] содержит некорректное значение"
                )));
            }
        }
        for (i, p) in self.cpu.perc.iter().enumerate() {
            check_percent(&format!("cpu.perc[{i}]"), *p)?;
        }
        if let Some(t) = self.cpu.temp {
            if !t.is_finite() {
                return Err(CodecError::Invalid("cpu.temp не число".to_string()));
            }
        }
        check_percent("memory.virtual.percent", self.memory.virtual_mem.percent)?;
        check_percent("memory.swap.percent", self.memory.swap.percent)?;
        for (path, d) in &self.disk {
            check_percent(&format!("disk[{path}].percent"), d.percent)?;
        }
        Ok(())
    }
}

fn check_percent(field: &str, value: f64) -> Result<(), CodecError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(CodecError::Invalid(format!(
            "{field} = {value} вне диапазона 0..100"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub snapshot: Arc<Snapshot>,
    pub text: Arc<str>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a str,
    data: &'a Snapshot,
}

pub fn encode_stats_update(snapshot: Snapshot) -> Result<Frame, CodecError> {
    snapshot.validate()?;
    let text = serde_json::to_string(&Envelope {
        event: STATS_UPDATE_EVENT,
        data: &snapshot,
    })?;
    Ok(Frame {
        snapshot: Arc::new(snapshot),
        text: Arc::from(text),
    })
}

pub fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
pub(crate) fn sample_snapshot() -> Snapshot {
    Snapshot {
        system: SystemInfo {
            model: "Raspberry Pi 4 Model B Rev 1.4".to_string(),
            hostname: "pi".to_string(),
        },
        cpu: CpuInfo {
            freq: vec![CpuFreq {
                current: 1500.0,
                min: 600.0,
                max: 1500.0,
            }],
            perc: vec![12.5],
            temp: None,
        },
        memory: MemoryInfo {
            virtual_mem: VirtualMemory {
                total: 4_000_000_000,
                used: 1_000_000_000,
                free: 2_500_000_000,
                percent: 25.0,
                available: 3_000_000_000,
                ..VirtualMemory::default()
            },
            swap: SwapMemory::default(),
        },
        disk: BTreeMap::new(),
    }
}
