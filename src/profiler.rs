//! Scoped timing capture for the dispatch pipeline.
//!
//! A [`ProfilerRecorder`] brackets one operation: it grabs a timestamp when
//! constructed and appends a [`ProfilerData`] record when dropped, so the
//! record is emitted on every exit path, including unwinds out of a failing
//! task. The [`ProfilerAnalyzer`] collects records between [`start_step`] and
//! [`end_step`] and aggregates them into per-module / per-event / per-op
//! statistics, written as a JSON-lines trace plus a text summary through a
//! [`ProfilerSink`].
//!
//! The analyzer is an injected handle (`Arc<ProfilerAnalyzer>`), not a process
//! singleton; tests run with a capturing sink. All of its state sits behind
//! one mutex, which is fine for a diagnostic subsystem off the hot numeric
//! path.
//!
//! [`start_step`]: ProfilerAnalyzer::start_step
//! [`end_step`]: ProfilerAnalyzer::end_step

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::{Context, Result};

/// Placeholder op name for events that are not tied to a specific op.
pub const NO_NAME: &str = "Default";

const PERCENT: f64 = 100.0;

/// Coarse subsystem that produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProfilerModule {
    Default,
    Runtime,
    Pynative,
    Kernel,
    Other,
}

/// Fine-grained event kind within a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProfilerEvent {
    Default,
    KernelInfer,
    KernelLaunch,
    FrontendTask,
    BackendTask,
    DeviceTask,
    WaitTaskFinish,
    MemoryAlloc,
    CopyData,
    StreamSync,
    // Inner events overlap an outer event of the same module and are kept out
    // of the module totals.
    KernelInferInner,
}

/// Broad phase bracketed by a [`ProfilerStageRecorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProfilerStage {
    Default,
    Python,
    RunOp,
    WaitPipeline,
    SyncStream,
}

/// One completed timing record, either for an event or for a whole stage.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfilerData {
    Event {
        module: ProfilerModule,
        event: ProfilerEvent,
        op_name: String,
        is_inner: bool,
        start_us: u64,
        end_us: u64,
        dur_us: u64,
        tid: u64,
        pid: u32,
    },
    Stage {
        stage: ProfilerStage,
        start_us: u64,
        end_us: u64,
        dur_us: u64,
        tid: u64,
        pid: u32,
    },
}

impl ProfilerData {
    fn dur_us(&self) -> u64 {
        match self {
            Self::Event { dur_us, .. } | Self::Stage { dur_us, .. } => *dur_us,
        }
    }
}

fn current_tid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

/// Aggregated statistics for one name (stage, module, event or op).
#[derive(Clone, Debug)]
pub struct ProfilerStatisticsInfo {
    pub name: String,
    pub is_inner: bool,
    pub count: usize,
    pub total_time_us: u64,
    pub average_time_us: f64,
    pub percent: f64,
}

impl ProfilerStatisticsInfo {
    pub fn new(name: impl Into<String>, is_inner: bool) -> Self {
        Self {
            name: name.into(),
            is_inner,
            count: 0,
            total_time_us: 0,
            average_time_us: 0.0,
            percent: 0.0,
        }
    }

    pub fn accumulate_time(&mut self, time_us: u64) {
        self.total_time_us += time_us;
        self.count += 1;
    }

    // Zero counts / zero step totals mean a broken step boundary, which is a
    // programming error rather than a runtime condition to recover from.
    pub fn average(&mut self) {
        assert!(self.count != 0, "zero count for '{}'", self.name);
        self.average_time_us = self.total_time_us as f64 / self.count as f64;
    }

    pub fn calculate_percent(&mut self, total_time_us: u64) {
        assert!(total_time_us != 0, "zero step total for '{}'", self.name);
        self.percent = (self.total_time_us as f64 / total_time_us as f64) * PERCENT;
    }
}

/// Where the per-step artifacts go. Implemented for the filesystem below and
/// by capturing fakes in tests.
pub trait ProfilerSink: Send + Sync {
    /// One JSON object per line, one line per record of the step.
    fn write_trace(&self, step: usize, json_lines: &str) -> Result<()>;
    /// Human-readable per-step summary.
    fn write_summary(&self, step: usize, summary: &str) -> Result<()>;
}

/// Filesystem sink writing `trace_step_N.json` / `summary_step_N.txt` into a
/// directory.
pub struct FsSink {
    dir: PathBuf,
}

impl FsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, name: String, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating profiler dir {}", self.dir.display()))?;
        let path = self.dir.join(name);
        let mut file =
            fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl ProfilerSink for FsSink {
    fn write_trace(&self, step: usize, json_lines: &str) -> Result<()> {
        self.write(format!("trace_step_{step}.json"), json_lines)
    }

    fn write_summary(&self, step: usize, summary: &str) -> Result<()> {
        self.write(format!("summary_step_{step}.txt"), summary)
    }
}

/// A sink that drops everything, for disabled profiling.
pub struct NullSink;

impl ProfilerSink for NullSink {
    fn write_trace(&self, _step: usize, _json_lines: &str) -> Result<()> {
        Ok(())
    }

    fn write_summary(&self, _step: usize, _summary: &str) -> Result<()> {
        Ok(())
    }
}

/// Profiler configuration, usually read from the environment:
/// `OPSTREAM_PROFILE` (enable, "1"/"true"), `OPSTREAM_PROFILE_TOP_NUM`
/// (ops shown per event in the summary), `OPSTREAM_PROFILE_DIR`
/// (output directory for [`FsSink`]).
#[derive(Clone, Debug)]
pub struct ProfilerConfig {
    pub enable: bool,
    pub show_top_num: usize,
    pub output_dir: PathBuf,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            show_top_num: 10,
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("opstream")
        .join("profiler")
}

impl ProfilerConfig {
    pub fn from_env() -> Self {
        let enable = std::env::var("OPSTREAM_PROFILE")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let show_top_num = std::env::var("OPSTREAM_PROFILE_TOP_NUM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let output_dir = std::env::var("OPSTREAM_PROFILE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_output_dir());
        Self {
            enable,
            show_top_num,
            output_dir,
        }
    }

    /// Build an enabled config writing into `dir`.
    pub fn enabled(dir: impl Into<PathBuf>) -> Self {
        Self {
            enable: true,
            show_top_num: 10,
            output_dir: dir.into(),
        }
    }
}

struct EventSummary {
    statistics: ProfilerStatisticsInfo,
    op_infos: BTreeMap<String, ProfilerStatisticsInfo>,
}

struct ModuleSummary {
    statistics: ProfilerStatisticsInfo,
    event_infos: BTreeMap<ProfilerEvent, EventSummary>,
}

#[derive(Default)]
struct StepState {
    step: usize,
    step_start_us: Option<u64>,
    data: Vec<ProfilerData>,
}

/// Collects records and produces per-step summaries. One per process by
/// convention, but explicitly constructed and shared via `Arc` rather than a
/// global.
pub struct ProfilerAnalyzer {
    enable: bool,
    show_top_num: usize,
    origin: Instant,
    sink: Box<dyn ProfilerSink>,
    state: Mutex<StepState>,
}

impl ProfilerAnalyzer {
    pub fn new(config: &ProfilerConfig, sink: Box<dyn ProfilerSink>) -> Self {
        Self {
            enable: config.enable,
            show_top_num: config.show_top_num,
            origin: Instant::now(),
            sink,
            state: Mutex::new(StepState::default()),
        }
    }

    /// Enabled analyzer writing into the config's output directory.
    pub fn from_config(config: &ProfilerConfig) -> Self {
        let sink: Box<dyn ProfilerSink> = if config.enable {
            Box::new(FsSink::new(config.output_dir.clone()))
        } else {
            Box::new(NullSink)
        };
        Self::new(config, sink)
    }

    /// Disabled analyzer; recorders built against it are near-free no-ops.
    pub fn disabled() -> Self {
        Self::new(&ProfilerConfig::default(), Box::new(NullSink))
    }

    pub fn profiler_enable(&self) -> bool {
        self.enable
    }

    /// Monotonic microseconds since the analyzer was created.
    pub fn timestamp_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Append one completed record to the step log.
    pub fn record_data(&self, data: ProfilerData) {
        if !self.enable {
            return;
        }
        let mut state = self.state.lock().expect("profiler state lock poisoned");
        state.data.push(data);
    }

    /// Mark the step begin.
    pub fn start_step(&self) {
        if !self.enable {
            return;
        }
        let now = self.timestamp_us();
        let mut state = self.state.lock().expect("profiler state lock poisoned");
        state.step += 1;
        state.step_start_us = Some(now);
        state.data.clear();
    }

    /// Aggregate the step's records, dump the trace and summary through the
    /// sink, and clear per-step state.
    pub fn end_step(&self) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        let now = self.timestamp_us();
        let mut state = self.state.lock().expect("profiler state lock poisoned");
        if state.data.is_empty() {
            state.step_start_us = None;
            return Ok(());
        }
        let step = state.step;
        let step_time_us = state
            .step_start_us
            .map(|start| now.saturating_sub(start))
            .unwrap_or_else(|| state.data.iter().map(ProfilerData::dur_us).sum());
        let data = std::mem::take(&mut state.data);
        state.step_start_us = None;
        drop(state);

        let mut json_lines = String::new();
        for record in &data {
            let line = serde_json::to_string(record).context("serializing profiler record")?;
            json_lines.push_str(&line);
            json_lines.push('\n');
        }
        let summary = self.summarize(step, step_time_us, &data);
        self.sink.write_trace(step, &json_lines)?;
        self.sink.write_summary(step, &summary)?;
        Ok(())
    }

    /// Derive the aggregation key from a fully scoped op name: the segment
    /// after the last '/', truncated at the first '-'. Deterministic and
    /// idempotent; distinct qualified names may intentionally share a bucket.
    pub fn brief_name(scope_name: &str) -> String {
        let tail = scope_name.rsplit('/').next().unwrap_or(scope_name);
        let head = tail.split('-').next().unwrap_or(tail);
        head.to_string()
    }

    fn summarize(&self, step: usize, step_time_us: u64, data: &[ProfilerData]) -> String {
        let mut stage_infos: BTreeMap<ProfilerStage, ProfilerStatisticsInfo> = BTreeMap::new();
        let mut module_infos: BTreeMap<ProfilerModule, ModuleSummary> = BTreeMap::new();
        let mut module_total_us: u64 = 0;

        for record in data {
            match record {
                ProfilerData::Stage { stage, dur_us, .. } => {
                    stage_infos
                        .entry(*stage)
                        .or_insert_with(|| ProfilerStatisticsInfo::new(format!("{stage:?}"), false))
                        .accumulate_time(*dur_us);
                }
                ProfilerData::Event {
                    module,
                    event,
                    op_name,
                    is_inner,
                    dur_us,
                    ..
                } => {
                    let module_summary =
                        module_infos.entry(*module).or_insert_with(|| ModuleSummary {
                            statistics: ProfilerStatisticsInfo::new(format!("{module:?}"), false),
                            event_infos: BTreeMap::new(),
                        });
                    if !is_inner {
                        module_summary.statistics.accumulate_time(*dur_us);
                        module_total_us += *dur_us;
                    }
                    let event_summary = module_summary
                        .event_infos
                        .entry(*event)
                        .or_insert_with(|| EventSummary {
                            statistics: ProfilerStatisticsInfo::new(format!("{event:?}"), *is_inner),
                            op_infos: BTreeMap::new(),
                        });
                    event_summary.statistics.accumulate_time(*dur_us);
                    event_summary
                        .op_infos
                        .entry(op_name.clone())
                        .or_insert_with(|| ProfilerStatisticsInfo::new(op_name.clone(), *is_inner))
                        .accumulate_time(*dur_us);
                }
            }
        }

        let mut out = String::new();
        out.push_str(&format!("[Step] {step}: total {step_time_us}us\n"));

        for info in stage_infos.values_mut() {
            info.average();
            info.calculate_percent(step_time_us);
            out.push_str(&format!(
                "[Stage] {}: count {}, total {}us, average {:.1}us, {:.1}%\n",
                info.name, info.count, info.total_time_us, info.average_time_us, info.percent
            ));
        }

        for module_summary in module_infos.values_mut() {
            let module_stat = &mut module_summary.statistics;
            if module_stat.count != 0 {
                module_stat.average();
                if module_total_us != 0 {
                    module_stat.calculate_percent(module_total_us);
                }
            }
            out.push_str(&format!(
                "[Module] {}: count {}, total {}us, {:.1}%\n",
                module_stat.name, module_stat.count, module_stat.total_time_us, module_stat.percent
            ));
            let module_event_total = module_stat.total_time_us;
            for event_summary in module_summary.event_infos.values_mut() {
                let event_stat = &mut event_summary.statistics;
                event_stat.average();
                if !event_stat.is_inner && module_event_total != 0 {
                    event_stat.calculate_percent(module_event_total);
                }
                out.push_str(&format!(
                    "  [Event] {}: count {}, total {}us, average {:.1}us, {:.1}%\n",
                    event_stat.name,
                    event_stat.count,
                    event_stat.total_time_us,
                    event_stat.average_time_us,
                    event_stat.percent
                ));
                let event_total = event_stat.total_time_us;
                let mut ops: Vec<&mut ProfilerStatisticsInfo> =
                    event_summary.op_infos.values_mut().collect();
                ops.sort_by(|a, b| b.total_time_us.cmp(&a.total_time_us));
                for op in ops.into_iter().take(self.show_top_num) {
                    op.average();
                    if event_total != 0 {
                        op.calculate_percent(event_total);
                    }
                    out.push_str(&format!(
                        "    [Op] {}: count {}, total {}us, average {:.1}us, {:.1}%\n",
                        op.name, op.count, op.total_time_us, op.average_time_us, op.percent
                    ));
                }
            }
        }
        out
    }
}

/// Scoped event recorder. Holds nothing when profiling is disabled.
pub struct ProfilerRecorder<'a> {
    inner: Option<RecorderInner<'a>>,
}

struct RecorderInner<'a> {
    analyzer: &'a ProfilerAnalyzer,
    module: ProfilerModule,
    event: ProfilerEvent,
    op_name: String,
    is_inner: bool,
    start_us: u64,
}

impl<'a> ProfilerRecorder<'a> {
    pub fn new(
        analyzer: &'a ProfilerAnalyzer,
        module: ProfilerModule,
        event: ProfilerEvent,
        op_name: &str,
        is_inner: bool,
    ) -> Self {
        if !analyzer.profiler_enable() {
            return Self { inner: None };
        }
        Self {
            inner: Some(RecorderInner {
                analyzer,
                module,
                event,
                op_name: ProfilerAnalyzer::brief_name(op_name),
                is_inner,
                start_us: analyzer.timestamp_us(),
            }),
        }
    }
}

impl Drop for ProfilerRecorder<'_> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let end_us = inner.analyzer.timestamp_us();
        inner.analyzer.record_data(ProfilerData::Event {
            module: inner.module,
            event: inner.event,
            op_name: inner.op_name,
            is_inner: inner.is_inner,
            start_us: inner.start_us,
            end_us,
            dur_us: end_us.saturating_sub(inner.start_us),
            tid: current_tid(),
            pid: std::process::id(),
        });
    }
}

/// Scoped stage recorder bracketing a broader phase, e.g. one training step's
/// Python section.
pub struct ProfilerStageRecorder<'a> {
    inner: Option<StageRecorderInner<'a>>,
}

struct StageRecorderInner<'a> {
    analyzer: &'a ProfilerAnalyzer,
    stage: ProfilerStage,
    start_us: u64,
}

impl<'a> ProfilerStageRecorder<'a> {
    pub fn new(analyzer: &'a ProfilerAnalyzer, stage: ProfilerStage) -> Self {
        if !analyzer.profiler_enable() {
            return Self { inner: None };
        }
        Self {
            inner: Some(StageRecorderInner {
                analyzer,
                stage,
                start_us: analyzer.timestamp_us(),
            }),
        }
    }
}

impl Drop for ProfilerStageRecorder<'_> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let end_us = inner.analyzer.timestamp_us();
        inner.analyzer.record_data(ProfilerData::Stage {
            stage: inner.stage,
            start_us: inner.start_us,
            end_us,
            dur_us: end_us.saturating_sub(inner.start_us),
            tid: current_tid(),
            pid: std::process::id(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brief_name_takes_last_segment_before_dash() {
        assert_eq!(ProfilerAnalyzer::brief_name("Net/Layer/Add-op12"), "Add");
        assert_eq!(ProfilerAnalyzer::brief_name("Add"), "Add");
        assert_eq!(ProfilerAnalyzer::brief_name("Net/Mul"), "Mul");
    }

    #[test]
    fn disabled_recorder_records_nothing() {
        let analyzer = ProfilerAnalyzer::disabled();
        {
            let _r = ProfilerRecorder::new(
                &analyzer,
                ProfilerModule::Pynative,
                ProfilerEvent::FrontendTask,
                NO_NAME,
                false,
            );
        }
        assert!(analyzer.state.lock().unwrap().data.is_empty());
    }
}
