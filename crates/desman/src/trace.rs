use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use desman_accel::{KernelRecord, ProfileSink};
use desman_core::{Error, Result, Shape};

// Trace recorder
//
// Nested spans: one layer span per logical operator invocation (opened and
// closed by the platform on the issuing thread), one kernel span per device
// dispatch inside it (delivered by the dispatcher's completion sink on the
// worker thread). Timestamps are microseconds since the recorder was
// created; kernel spans additionally carry the device-measured duration.

/// One device dispatch inside a layer.
#[derive(Debug, Clone, Serialize)]
pub struct KernelSpan {
    pub op_id: u64,
    pub kernel: String,
    pub shapes: Vec<String>,
    pub params: String,
    pub device_micros: u64,
}

/// One logical operator invocation.
#[derive(Debug, Clone, Serialize)]
pub struct LayerSpan {
    pub layer_id: u64,
    pub name: String,
    pub shapes: Vec<String>,
    pub start_micros: u64,
    /// None while the layer is still open.
    pub end_micros: Option<u64>,
    pub kernels: Vec<KernelSpan>,
}

#[derive(Default)]
struct TraceState {
    layers: Vec<LayerSpan>,
    index: HashMap<u64, usize>,
    /// Kernel spans whose layer id matches no recorded layer (dispatches
    /// issued outside any platform operator call).
    orphans: Vec<KernelSpan>,
}

/// Collects layer and kernel spans for one platform instance.
pub struct TraceRecorder {
    epoch: Instant,
    state: Mutex<TraceState>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        TraceRecorder {
            epoch: Instant::now(),
            state: Mutex::new(TraceState::default()),
        }
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Open a layer span. Called by the platform before the operator runs.
    pub fn begin_layer(&self, layer_id: u64, name: &str, shapes: Vec<Shape>) {
        let start = self.now_micros();
        let mut state = self.state.lock().unwrap();
        let idx = state.layers.len();
        state.layers.push(LayerSpan {
            layer_id,
            name: name.to_string(),
            shapes: shapes.iter().map(|s| s.to_string()).collect(),
            start_micros: start,
            end_micros: None,
            kernels: Vec::new(),
        });
        state.index.insert(layer_id, idx);
    }

    /// Close a layer span. Kernel completions may still land in it
    /// afterwards; device work can outlive the issuing call.
    pub fn end_layer(&self, layer_id: u64) {
        let end = self.now_micros();
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.index.get(&layer_id) {
            state.layers[idx].end_micros = Some(end);
        }
    }

    /// All layer spans recorded so far.
    pub fn layers(&self) -> Vec<LayerSpan> {
        self.state.lock().unwrap().layers.clone()
    }

    /// Aggregate device time per kernel name, sorted by total descending.
    pub fn report(&self) -> TraceReport {
        let state = self.state.lock().unwrap();
        let mut by_name: HashMap<String, Vec<Duration>> = HashMap::new();
        let spans = state
            .layers
            .iter()
            .flat_map(|l| l.kernels.iter())
            .chain(state.orphans.iter());
        for span in spans {
            by_name
                .entry(span.kernel.clone())
                .or_default()
                .push(Duration::from_micros(span.device_micros));
        }
        let mut entries: Vec<TraceEntry> = by_name
            .into_iter()
            .map(|(name, durations)| {
                let count = durations.len();
                let total: Duration = durations.iter().sum();
                let min = durations.iter().min().copied().unwrap_or_default();
                let max = durations.iter().max().copied().unwrap_or_default();
                let avg = total / count as u32;
                TraceEntry {
                    name,
                    count,
                    total,
                    min,
                    max,
                    avg,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.total.cmp(&a.total));
        let total = entries.iter().map(|e| e.total).sum();
        TraceReport { entries, total }
    }

    /// The full span tree as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        let export = TraceExport {
            layers: &state.layers,
            orphans: &state.orphans,
        };
        serde_json::to_string_pretty(&export)
            .map_err(|e| Error::msg(format!("trace serialization failed: {e}")))
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        TraceRecorder::new()
    }
}

impl ProfileSink for TraceRecorder {
    fn kernel_complete(&self, record: KernelRecord) {
        let span = KernelSpan {
            op_id: record.op_id,
            kernel: record.kernel.to_string(),
            shapes: record.shapes.iter().map(|s| s.to_string()).collect(),
            params: record.params,
            device_micros: record.device_span.as_micros() as u64,
        };
        let mut state = self.state.lock().unwrap();
        match state.index.get(&record.layer_id).copied() {
            Some(idx) => state.layers[idx].kernels.push(span),
            None => state.orphans.push(span),
        }
    }
}

#[derive(Serialize)]
struct TraceExport<'a> {
    layers: &'a [LayerSpan],
    orphans: &'a [KernelSpan],
}

/// Aggregated statistics for one kernel name.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// Per-kernel device-time summary, printed with `Display`.
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub entries: Vec<TraceEntry>,
    pub total: Duration,
}

impl fmt::Display for TraceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20} {:>6} {:>12} {:>12} {:>24}",
            "kernel", "count", "total", "avg", "min/max"
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "{:<20} {:>6} {:>12.2?} {:>12.2?} {:>11.2?}/{:<11.2?}",
                entry.name, entry.count, entry.total, entry.avg, entry.min, entry.max
            )?;
        }
        writeln!(f, "total device time: {:.2?}", self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op_id: u64, layer_id: u64, kernel: &'static str, micros: u64) -> KernelRecord {
        KernelRecord {
            op_id,
            layer_id,
            kernel,
            shapes: vec![Shape::from((2, 3))],
            params: String::new(),
            device_span: Duration::from_micros(micros),
        }
    }

    #[test]
    fn test_kernel_spans_nest_under_their_layer() {
        let trace = TraceRecorder::new();
        trace.begin_layer(1, "matmul", vec![Shape::from((2, 3))]);
        trace.kernel_complete(record(1, 1, "matmul", 10));
        trace.end_layer(1);
        let layers = trace.layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "matmul");
        assert!(layers[0].end_micros.is_some());
        assert_eq!(layers[0].kernels.len(), 1);
        assert_eq!(layers[0].kernels[0].kernel, "matmul");
    }

    #[test]
    fn test_unmatched_kernel_goes_to_orphans() {
        let trace = TraceRecorder::new();
        trace.kernel_complete(record(1, 99, "add", 5));
        assert!(trace.layers().is_empty());
        let report = trace.report();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].name, "add");
    }

    #[test]
    fn test_report_aggregates_and_sorts_by_total() {
        let trace = TraceRecorder::new();
        trace.begin_layer(1, "work", Vec::new());
        trace.kernel_complete(record(1, 1, "add", 5));
        trace.kernel_complete(record(2, 1, "add", 15));
        trace.kernel_complete(record(3, 1, "matmul", 100));
        trace.end_layer(1);
        let report = trace.report();
        assert_eq!(report.entries[0].name, "matmul");
        assert_eq!(report.entries[1].name, "add");
        assert_eq!(report.entries[1].count, 2);
        assert_eq!(report.entries[1].total, Duration::from_micros(20));
        assert_eq!(report.entries[1].avg, Duration::from_micros(10));
        assert_eq!(report.total, Duration::from_micros(120));
    }

    #[test]
    fn test_json_export_round_trips_names() {
        let trace = TraceRecorder::new();
        trace.begin_layer(1, "conv2d", vec![Shape::from((1, 1, 3, 3))]);
        trace.kernel_complete(record(1, 1, "conv2d", 42));
        trace.end_layer(1);
        let json = trace.to_json().unwrap();
        assert!(json.contains("\"conv2d\""));
        assert!(json.contains("\"device_micros\": 42"));
    }
}
