use std::sync::Mutex;

use serde::{Serialize, ser::SerializeStruct};
use sysinfo::{Disks, System};
use tracing::warn;

use crate::worker::types::{CpuStat, DiskInfo, LoadAvg, MemInfo, Stats, StatsError};

const PROC_STAT: &str = "/proc/stat";

impl Stats {
    pub fn mem_total_kb(&self) -> u64 {
        self.mem_stats.mem_total
    }

    pub fn mem_available_kb(&self) -> u64 {
        self.mem_stats.mem_available
    }

    pub fn mem_used_kb(&self) -> u64 {
        self.mem_stats.mem_total.saturating_sub(self.mem_stats.mem_available)
    }

    /// Ratio of available to total memory.
    ///
    /// NOTE: despite the name this is the *available* fraction. It is reported
    /// as such until consumers agree on the intended meaning.
    pub fn mem_used_percent(&self) -> f64 {
        if self.mem_stats.mem_total == 0 {
            return 0.0;
        }
        self.mem_stats.mem_available as f64 / self.mem_stats.mem_total as f64
    }

    pub fn disk_total(&self) -> u64 {
        self.disk_stats.all
    }

    pub fn disk_free(&self) -> u64 {
        self.disk_stats.free
    }

    pub fn disk_used(&self) -> u64 {
        self.disk_stats.used
    }

    /// Fraction of CPU time spent outside idle and iowait, in `[0, 1]`.
    pub fn cpu_usage(&self) -> f64 {
        let cpu = &self.cpu_stats;
        let idle = cpu.idle + cpu.iowait;
        let non_idle = cpu.user + cpu.nice + cpu.system + cpu.irq + cpu.softirq + cpu.steal;
        let total = idle + non_idle;

        if total == 0 {
            return 0.0;
        }

        (total - idle) as f64 / total as f64
    }

    /// Takes a fresh sample. Any source that cannot be read is reported as
    /// zeroes.
    pub fn sample(metrics: &dyn HostMetrics, task_count: usize) -> Self {
        Stats {
            mem_stats: metrics.memory().unwrap_or_else(|e| {
                warn!(error = %e, "error reading memory info");
                MemInfo::default()
            }),
            disk_stats: metrics.disk().unwrap_or_else(|e| {
                warn!(error = %e, "error reading disk info");
                DiskInfo::default()
            }),
            cpu_stats: metrics.cpu().unwrap_or_else(|e| {
                warn!(error = %e, "error reading cpu stats");
                CpuStat::default()
            }),
            load_stats: metrics.load_avg().unwrap_or_else(|e| {
                warn!(error = %e, "error reading load average");
                LoadAvg::default()
            }),
            task_count,
        }
    }
}

impl Serialize for Stats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Stats", 13)?;
        state.serialize_field("mem_stats", &self.mem_stats)?;
        state.serialize_field("disk_stats", &self.disk_stats)?;
        state.serialize_field("cpu_stats", &self.cpu_stats)?;
        state.serialize_field("load_stats", &self.load_stats)?;
        state.serialize_field("task_count", &self.task_count)?;
        state.serialize_field("mem_total_kb", &self.mem_total_kb())?;
        state.serialize_field("mem_available_kb", &self.mem_available_kb())?;
        state.serialize_field("mem_used_kb", &self.mem_used_kb())?;
        state.serialize_field("mem_used_percent", &self.mem_used_percent())?;
        state.serialize_field("disk_total", &self.disk_total())?;
        state.serialize_field("disk_free", &self.disk_free())?;
        state.serialize_field("disk_used", &self.disk_used())?;
        state.serialize_field("cpu_usage", &self.cpu_usage())?;
        state.end()
    }
}

/// Source of host accounting data.
pub trait HostMetrics: Send + Sync {
    fn memory(&self) -> Result<MemInfo, StatsError>;
    fn disk(&self) -> Result<DiskInfo, StatsError>;
    fn cpu(&self) -> Result<CpuStat, StatsError>;
    fn load_avg(&self) -> Result<LoadAvg, StatsError>;
}

/// Reads the local host through sysinfo, plus `/proc/stat` for CPU counters.
pub struct SysinfoMetrics {
    system: Mutex<System>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        SysinfoMetrics {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SysinfoMetrics {
    fn memory(&self) -> Result<MemInfo, StatsError> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(StatsError::Unavailable("memory"));
        }

        Ok(MemInfo {
            mem_total: total / 1024,
            mem_available: system.available_memory() / 1024,
        })
    }

    fn disk(&self) -> Result<DiskInfo, StatsError> {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"))
            .ok_or(StatsError::Unavailable("root filesystem"))?;

        let all = root.total_space();
        let free = root.available_space();
        Ok(DiskInfo {
            all,
            free,
            used: all.saturating_sub(free),
        })
    }

    fn cpu(&self) -> Result<CpuStat, StatsError> {
        let contents = std::fs::read_to_string(PROC_STAT).map_err(|source| StatsError::Io {
            path: PROC_STAT.to_string(),
            source,
        })?;
        parse_cpu_stat(&contents)
    }

    fn load_avg(&self) -> Result<LoadAvg, StatsError> {
        let load = System::load_average();
        Ok(LoadAvg {
            last1min: load.one,
            last5min: load.five,
            last15min: load.fifteen,
        })
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_stat(contents: &str) -> Result<CpuStat, StatsError> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| StatsError::Parse(format!("{PROC_STAT}: no aggregate cpu line")))?;

    let counters = line
        .split_whitespace()
        .skip(1)
        .map(|field| {
            field
                .parse::<u64>()
                .map_err(|_| StatsError::Parse(format!("{PROC_STAT}: bad counter {field:?}")))
        })
        .collect::<Result<Vec<u64>, _>>()?;

    if counters.len() < 4 {
        return Err(StatsError::Parse(format!("{PROC_STAT}: too few cpu counters")));
    }

    let at = |i: usize| counters.get(i).copied().unwrap_or(0);
    Ok(CpuStat {
        user: at(0),
        nice: at(1),
        system: at(2),
        idle: at(3),
        iowait: at(4),
        irq: at(5),
        softirq: at(6),
        steal: at(7),
    })
}
