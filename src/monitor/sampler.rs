use chrono::Utc;
use std::sync::Mutex;
use tracing::debug;

use super::gpu;
use super::ResourceMetrics;

/// Collects system resource snapshots from `/proc` and friends.
///
/// CPU usage is computed from deltas between consecutive samples, so
/// the first sample reports 0%.
pub struct ResourceSampler {
    gpu_available: bool,
    prev_cpu: Mutex<Option<CpuCounters>>,
}

#[derive(Debug, Clone, Copy)]
struct CpuCounters {
    busy: u64,
    total: u64,
}

impl ResourceSampler {
    pub fn new(gpu_available: bool) -> Self {
        Self {
            gpu_available,
            prev_cpu: Mutex::new(None),
        }
    }

    pub async fn sample(&self) -> ResourceMetrics {
        let (memory_percent, memory_used_mb, memory_available_mb) = read_memory_info();
        let (disk_percent, disk_free_gb) = read_disk_info();
        let (network_bytes_sent, network_bytes_recv) = read_network_counters();
        let (gpu_percent, gpu_memory_percent) = if self.gpu_available {
            gpu::sample()
        } else {
            (None, None)
        };

        ResourceMetrics {
            timestamp: Utc::now(),
            cpu_percent: self.cpu_percent(),
            memory_percent,
            memory_used_mb,
            memory_available_mb,
            disk_percent,
            disk_free_gb,
            network_bytes_sent,
            network_bytes_recv,
            gpu_percent,
            gpu_memory_percent,
            process_count: read_process_count(),
            thread_count: read_thread_count(),
            open_files: read_open_files(),
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(current) = read_cpu_counters() else {
            return 0.0;
        };
        let mut prev = self.prev_cpu.lock().unwrap();
        let percent = match *prev {
            Some(previous) => {
                let total_delta = current.total.saturating_sub(previous.total);
                let busy_delta = current.busy.saturating_sub(previous.busy);
                if total_delta > 0 {
                    busy_delta as f64 / total_delta as f64 * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *prev = Some(current);
        percent
    }
}

fn read_cpu_counters() -> Option<CpuCounters> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuCounters {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn read_memory_info() -> (f64, f64, f64) {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return (0.0, 0.0, 0.0);
    };

    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 {
            let value: u64 = fields[1].parse().unwrap_or(0);
            match fields[0] {
                "MemTotal:" => total_kb = value,
                "MemAvailable:" => available_kb = value,
                _ => {}
            }
        }
    }

    if total_kb == 0 {
        return (0.0, 0.0, 0.0);
    }
    let used_kb = total_kb.saturating_sub(available_kb);
    (
        used_kb as f64 / total_kb as f64 * 100.0,
        used_kb as f64 / 1024.0,
        available_kb as f64 / 1024.0,
    )
}

fn read_disk_info() -> (f64, f64) {
    use std::process::Command;

    if let Ok(output) = Command::new("df").arg("-B1").arg("/").output() {
        let output_str = String::from_utf8_lossy(&output.stdout);
        for line in output_str.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 {
                let total: u64 = fields[1].parse().unwrap_or(0);
                let used: u64 = fields[2].parse().unwrap_or(0);
                let free: u64 = fields[3].parse().unwrap_or(0);
                if total > 0 {
                    return (
                        used as f64 / total as f64 * 100.0,
                        free as f64 / 1_073_741_824.0,
                    );
                }
            }
        }
    }
    debug!("Disk usage probe failed, reporting zeros");
    (0.0, 0.0)
}

fn read_network_counters() -> (u64, u64) {
    let Ok(content) = std::fs::read_to_string("/proc/net/dev") else {
        return (0, 0);
    };

    let mut sent = 0u64;
    let mut received = 0u64;
    for line in content.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 10 {
            let interface = fields[0].trim_end_matches(':');
            if interface.starts_with("lo") {
                continue;
            }
            received += fields[1].parse::<u64>().unwrap_or(0);
            sent += fields[9].parse::<u64>().unwrap_or(0);
        }
    }
    (sent, received)
}

fn read_process_count() -> u32 {
    match std::fs::read_dir("/proc") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .chars()
                    .all(char::is_numeric)
            })
            .count() as u32,
        Err(_) => 0,
    }
}

fn read_thread_count() -> u32 {
    if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("Threads:") {
                return rest.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn read_open_files() -> u32 {
    match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries.count() as u32,
        Err(_) => 0,
    }
}
