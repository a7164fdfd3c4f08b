use std::fs;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

// Host load sampler
//
// A background thread reads the aggregate "cpu " line of /proc/stat on an
// interval and publishes the utilization over the last interval. The sampler
// is independent of the tensor pipeline; it shares no state with the device
// worker and never blocks it. The thread is joined on drop.

const PROC_STAT: &str = "/proc/stat";

/// Cumulative jiffy counters from one /proc/stat reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuCounters {
    busy: u64,
    total: u64,
}

/// Parse the aggregate cpu line ("cpu  user nice system idle iowait ...").
/// Busy time is everything except idle and iowait.
fn parse_cpu_line(line: &str) -> Option<CpuCounters> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.map_while(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3];
    let iowait = values.get(4).copied().unwrap_or(0);
    Some(CpuCounters {
        busy: total - idle - iowait,
        total,
    })
}

fn read_counters() -> Option<CpuCounters> {
    let stat = fs::read_to_string(PROC_STAT).ok()?;
    stat.lines().next().and_then(parse_cpu_line)
}

/// Utilization over the interval between two readings, in 0.0..=1.0.
/// None when the counters did not advance.
fn utilization(prev: CpuCounters, next: CpuCounters) -> Option<f64> {
    let total = next.total.checked_sub(prev.total)?;
    if total == 0 {
        return None;
    }
    let busy = next.busy.saturating_sub(prev.busy);
    Some(busy as f64 / total as f64)
}

struct SamplerShared {
    stop: Mutex<bool>,
    wake: Condvar,
    latest: Mutex<Option<f64>>,
}

/// Samples host CPU utilization on a background thread.
pub struct HostLoadSampler {
    shared: Arc<SamplerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HostLoadSampler {
    /// Start sampling with the given interval. The first utilization value
    /// becomes available after one full interval has elapsed.
    pub fn start(interval: Duration) -> Self {
        let shared = Arc::new(SamplerShared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
            latest: Mutex::new(None),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("desman-sysmon".to_string())
            .spawn(move || {
                let mut prev = read_counters();
                if prev.is_none() {
                    log::warn!("{PROC_STAT} unavailable, host load sampling disabled");
                    return;
                }
                loop {
                    let stopped = {
                        let guard = worker.stop.lock().unwrap();
                        let (guard, _) = worker.wake.wait_timeout(guard, interval).unwrap();
                        *guard
                    };
                    if stopped {
                        break;
                    }
                    let next = read_counters();
                    if let (Some(p), Some(n)) = (prev, next) {
                        if let Some(load) = utilization(p, n) {
                            *worker.latest.lock().unwrap() = Some(load);
                        }
                    }
                    prev = next.or(prev);
                }
            })
            .expect("failed to spawn sysmon thread");
        HostLoadSampler {
            shared,
            handle: Some(handle),
        }
    }

    /// The most recent utilization reading, in 0.0..=1.0. None until the
    /// first interval completes (or when /proc/stat is unavailable).
    pub fn latest(&self) -> Option<f64> {
        *self.shared.latest.lock().unwrap()
    }
}

impl Drop for HostLoadSampler {
    fn drop(&mut self) {
        *self.shared.stop.lock().unwrap() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_line() {
        let c = parse_cpu_line("cpu  100 0 50 800 25 5 5 0 0 0").unwrap();
        assert_eq!(c.total, 985);
        assert_eq!(c.busy, 985 - 800 - 25);
        assert!(parse_cpu_line("cpu0 1 2 3 4").is_none());
        assert!(parse_cpu_line("intr 12345").is_none());
        assert!(parse_cpu_line("cpu 1 2").is_none());
    }

    #[test]
    fn test_utilization_between_readings() {
        let a = CpuCounters {
            busy: 100,
            total: 1000,
        };
        let b = CpuCounters {
            busy: 150,
            total: 1100,
        };
        let load = utilization(a, b).unwrap();
        assert!((load - 0.5).abs() < 1e-12);
        assert!(utilization(a, a).is_none());
        assert!(utilization(b, a).is_none());
    }

    #[test]
    fn test_sampler_lifecycle() {
        let sampler = HostLoadSampler::start(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(60));
        if let Some(load) = sampler.latest() {
            assert!((0.0..=1.0).contains(&load));
        }
        drop(sampler);
    }
}
