//! Operational counters for the end-of-run summary line.

use std::time::{Duration, Instant};

/// Accumulates call count and total time spent in an external system.
#[derive(Debug, Default)]
pub struct StopWatch {
    pub count: u64,
    pub total: Duration,
}

impl StopWatch {
    pub fn time_it<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.total += start.elapsed();
        self.count += 1;
        out
    }
}

/// Peak resident memory from /proc/self/status, in bytes. Best effort:
/// returns 0 on platforms without procfs.
pub fn read_vm_peak() -> u64 {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(s) => s,
        Err(_) => return 0,
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmPeak:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
