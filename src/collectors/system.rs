use crate::collectors::{SamplingConfig, SamplingError, StatsProvider};
use crate::snapshot::{
    percent_of, CpuFreq, CpuInfo, DiskUsage, MemoryInfo, Snapshot, SwapMemory, SystemInfo,
    VirtualMemory,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Mutex;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};
use tracing::debug;

pub const BOARD_MODEL_FILE: &str = "/sys/firmware/devicetree/base/model";
const UNKNOWN_MODEL: &str = "UNKNOWN";
const SWAP_PAGE_BYTES: u64 = 4096;

pub struct SystemStatsProvider {
    cfg: SamplingConfig,
    model: String,
    system: Mutex<System>,
}

impl SystemStatsProvider {
    pub fn new(cfg: SamplingConfig) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_components_list();
        Self {
            cfg,
            model: read_board_model().unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
            system: Mutex::new(system),
        }
    }
}

impl StatsProvider for SystemStatsProvider {
    fn sample(&self) -> Result<Snapshot, SamplingError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| SamplingError::Provider("состояние sysinfo повреждено".to_string()))?;
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_components();

        let hostname = system.host_name().unwrap_or_else(|| "unknown".to_string());
        let cpu = collect_cpu(&system, self.cfg.per_core);
        let memory = collect_memory(&system);
        let disk = collect_disks(self.cfg.monitored_paths.iter().map(String::as_str));

        Ok(Snapshot {
            system: SystemInfo {
                model: self.model.clone(),
                hostname,
            },
            cpu,
            memory,
            disk,
        })
    }
}

fn collect_cpu(system: &System, per_core: bool) -> CpuInfo {
    let cores: Vec<CpuFreq> = system
        .cpus()
        .iter()
        .enumerate()
        .map(|(idx, cpu)| {
            let (min, max) = read_cpufreq_limits(idx);
            CpuFreq {
                current: cpu.frequency() as f64,
                min,
                max,
            }
        })
        .collect();

    let (freq, perc) = if per_core {
        let perc = system
            .cpus()
            .iter()
            .map(|c| clamp_percent(c.cpu_usage() as f64))
            .collect();
        (cores, perc)
    } else {
        let global = clamp_percent(system.global_cpu_info().cpu_usage() as f64);
        (vec![aggregate_freq(&cores)], vec![global])
    };

    CpuInfo {
        freq,
        perc,
        temp: cpu_temperature(system),
    }
}

fn aggregate_freq(cores: &[CpuFreq]) -> CpuFreq {
    if cores.is_empty() {
        return CpuFreq {
            current: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    let current = cores.iter().map(|c| c.current).sum::<f64>() / cores.len() as f64;
    let min = cores.iter().map(|c| c.min).fold(f64::INFINITY, f64::min);
    let max = cores.iter().map(|c| c.max).fold(0.0_f64, f64::max);
    CpuFreq { current, min, max }
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn cpu_temperature(system: &System) -> Option<f64> {
    let components = system.components();
    if let Some(c) = components
        .iter()
        .find(|c| c.label().eq_ignore_ascii_case("cpu_thermal"))
    {
        return Some(c.temperature() as f64);
    }

    let markers = ["cpu", "package", "coretemp", "k10temp", "tctl", "tdie"];
    components
        .iter()
        .filter(|c| {
            let label = c.label().to_lowercase();
            markers.iter().any(|m| label.contains(m)) && !label.contains("gpu")
        })
        .map(|c| c.temperature() as f64)
        .filter(|t| t.is_finite() && *t > 0.0)
        .max_by(|a, b| a.total_cmp(b))
}

fn collect_memory(system: &System) -> MemoryInfo {
    let meminfo = read_kv_file("/proc/meminfo");
    let kb = |key: &str| meminfo.get(key).copied().unwrap_or(0).saturating_mul(1024);

    let total = system.total_memory();
    let available = system.available_memory();
    let virtual_mem = VirtualMemory {
        total,
        used: system.used_memory(),
        free: system.free_memory(),
        percent: percent_of(total.saturating_sub(available), total),
        available,
        active: kb("Active"),
        inactive: kb("Inactive"),
        buffers: kb("Buffers"),
        cached: kb("Cached"),
        shared: kb("Shmem"),
        slab: kb("Slab"),
    };

    let vmstat = read_kv_file("/proc/vmstat");
    let swap_total = system.total_swap();
    let swap_used = system.used_swap();
    let swap = SwapMemory {
        total: swap_total,
        used: swap_used,
        free: system.free_swap(),
        percent: percent_of(swap_used, swap_total),
        sin: vmstat.get("pswpin").copied().unwrap_or(0).saturating_mul(SWAP_PAGE_BYTES),
        sout: vmstat.get("pswpout").copied().unwrap_or(0).saturating_mul(SWAP_PAGE_BYTES),
    };

    MemoryInfo { virtual_mem, swap }
}

fn collect_disks<'a>(paths: impl Iterator<Item = &'a str>) -> BTreeMap<String, DiskUsage> {
    let mut out = BTreeMap::new();
    for path in paths {
        match path_usage(path) {
            Some(usage) => {
                out.insert(path.to_string(), usage);
            }
            None => debug!(path, "не удалось получить статистику файловой системы"),
        }
    }
    out
}

#[cfg(unix)]
fn path_usage(path: &str) -> Option<DiskUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is NUL-terminated and stat points to writable memory of the right size.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so it filled the struct.
    let stat = unsafe { stat.assume_init() };
    Some(usage_from_blocks(
        stat.f_blocks as u64,
        stat.f_bfree as u64,
        stat.f_bavail as u64,
        stat.f_frsize as u64,
    ))
}

#[cfg(not(unix))]
fn path_usage(_path: &str) -> Option<DiskUsage> {
    None
}

// `used` excludes reserved blocks and `percent` is relative to what an
// unprivileged user can reach, like `df`.
fn usage_from_blocks(blocks: u64, bfree: u64, bavail: u64, frsize: u64) -> DiskUsage {
    let total = blocks.saturating_mul(frsize);
    let free = bavail.saturating_mul(frsize);
    let used = blocks.saturating_sub(bfree).saturating_mul(frsize);
    DiskUsage {
        total,
        used,
        free,
        percent: percent_of(used, used.saturating_add(free)),
    }
}

pub fn read_board_model() -> Option<String> {
    let raw = fs::read_to_string(BOARD_MODEL_FILE).ok()?;
    let model = raw.replace('\u{0}', "").trim().to_string();
    if model.is_empty() {
        None
    } else {
        Some(model)
    }
}

pub fn is_raspberry_pi(model: Option<&str>) -> bool {
    model.is_some_and(|m| m.contains("Raspberry Pi"))
}

#[cfg(target_os = "linux")]
fn read_cpufreq_limits(cpu: usize) -> (f64, f64) {
    let base = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq");
    let read_mhz = |name: &str| {
        fs::read_to_string(format!("{base}/{name}"))
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|khz| khz / 1000.0)
            .unwrap_or(0.0)
    };
    (read_mhz("cpuinfo_min_freq"), read_mhz("cpuinfo_max_freq"))
}

#[cfg(not(target_os = "linux"))]
fn read_cpufreq_limits(_cpu: usize) -> (f64, f64) {
    (0.0, 0.0)
}

#[cfg(target_os = "linux")]
fn read_kv_file(path: &str) -> HashMap<String, u64> {
    fs::read_to_string(path)
        .map(|text| parse_kv(&text))
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn read_kv_file(_path: &str) -> HashMap<String, u64> {
    HashMap::new()
}

fn parse_kv(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?.trim_end_matches(':');
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}
