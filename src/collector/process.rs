//! Standard `process_*` metrics, refreshed on each scrape.

use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug)]
pub struct ProcessMetrics {
    system: Mutex<System>,
    pid: Option<Pid>,
    start_time_seconds: Gauge<f64, AtomicU64>,
    resident_memory_bytes: Gauge,
    virtual_memory_bytes: Gauge,
    open_fds: Gauge,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Process metrics unavailable: {}", e);
                None
            }
        };

        let metrics = Self {
            system: Mutex::new(System::new()),
            pid,
            start_time_seconds: Gauge::default(),
            resident_memory_bytes: Gauge::default(),
            virtual_memory_bytes: Gauge::default(),
            open_fds: Gauge::default(),
        };
        metrics.refresh();

        if metrics.start_time_seconds.get() == 0.0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            metrics.start_time_seconds.set(now);
        }
        metrics
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "process_start_time_seconds",
            "Start time of the process since unix epoch in seconds",
            self.start_time_seconds.clone(),
        );
        registry.register(
            "process_resident_memory_bytes",
            "Resident memory size in bytes",
            self.resident_memory_bytes.clone(),
        );
        registry.register(
            "process_virtual_memory_bytes",
            "Virtual memory size in bytes",
            self.virtual_memory_bytes.clone(),
        );
        #[cfg(target_os = "linux")]
        registry.register(
            "process_open_fds",
            "Number of open file descriptors",
            self.open_fds.clone(),
        );
    }

    pub fn start_time_seconds(&self) -> f64 {
        self.start_time_seconds.get()
    }

    pub fn resident_memory_bytes(&self) -> i64 {
        self.resident_memory_bytes.get()
    }

    pub fn virtual_memory_bytes(&self) -> i64 {
        self.virtual_memory_bytes.get()
    }

    pub fn refresh(&self) {
        if let Some(pid) = self.pid {
            let mut system = self.system.lock().unwrap();
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            match system.process(pid) {
                Some(process) => {
                    self.resident_memory_bytes.set(process.memory() as i64);
                    self.virtual_memory_bytes
                        .set(process.virtual_memory() as i64);
                    if process.start_time() > 0 {
                        self.start_time_seconds.set(process.start_time() as f64);
                    }
                }
                None => tracing::debug!("Process {} not found by sysinfo", pid),
            }
        }

        self.refresh_open_fds();
    }

    // sysinfo has no descriptor count.
    #[cfg(target_os = "linux")]
    fn refresh_open_fds(&self) {
        match std::fs::read_dir("/proc/self/fd") {
            Ok(entries) => {
                self.open_fds.set(entries.count() as i64);
            }
            Err(e) => tracing::debug!("Failed to read /proc/self/fd: {}", e),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn refresh_open_fds(&self) {}
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn start_time_is_set() {
        let metrics = ProcessMetrics::new();
        assert!(metrics.start_time_seconds() > 1_600_000_000.0);
    }

    #[test]
    fn refresh_reads_own_process() {
        let metrics = ProcessMetrics::new();
        metrics.refresh();
        assert!(metrics.resident_memory_bytes() > 0);
        assert!(metrics.virtual_memory_bytes() >= metrics.resident_memory_bytes());

        let mut registry = Registry::default();
        metrics.register(&mut registry);
        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(text.contains("process_resident_memory_bytes"));
        assert!(text.contains("process_virtual_memory_bytes"));
        assert!(text.contains("process_start_time_seconds"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn counts_open_fds() {
        let metrics = ProcessMetrics::new();
        metrics.refresh();
        assert!(metrics.open_fds.get() > 0);
    }
}
