//! Scriptable in-memory backend used by the unit tests.
//!
//! [`MockBackend`] plays the role of the platform capture engine: tests
//! script which ladder stages fail, whether module installation works,
//! whether streams die mid-setup, and then assert on the recorded calls.
//! [`MockOutputSink`] does the same for the playback side with a manually
//! advanced clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use async_trait::async_trait;

use crate::audio::constraints::{AcquireError, CaptureRequest, StageName, STAGES};
use crate::audio::path::SetupError;
use crate::playback::decode::DecodedAudio;
use crate::playback::scheduler::PlaybackError;

use super::{
    CaptureBackend, DeviceStream, MonitorSink, OutputFactory, OutputSink, ProcessingNode,
    ScheduledSegment,
};

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

type RejectFn = dyn Fn(StageName) -> AcquireError + Send + Sync;
type HookFn = dyn Fn() + Send + Sync;

#[derive(Default)]
struct BackendState {
    acquire_log: Mutex<Vec<StageName>>,
    acquire_hook: Mutex<Option<Arc<HookFn>>>,
    install_hook: Mutex<Option<Arc<HookFn>>>,
    stage_failures: Mutex<HashMap<StageName, AcquireError>>,
    reject_all: Mutex<Option<Arc<RejectFn>>>,
    low_latency: AtomicBool,
    fail_module_install: AtomicBool,
    kill_streams_on_install: AtomicBool,
    fail_low_latency_node: AtomicBool,
    fail_periodic_node: AtomicBool,
    fail_monitor: AtomicBool,
    module_installs: AtomicUsize,
    monitors_open: AtomicUsize,
    nodes_live: Arc<AtomicUsize>,
    stream_flags: Mutex<Vec<Arc<AtomicBool>>>,
    frame_senders: Mutex<Vec<Option<mpsc::Sender<Vec<f32>>>>>,
    output: Mutex<Option<Arc<MockOutputSink>>>,
    fail_output_open: AtomicBool,
}

/// Scriptable capture backend.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<BackendState>,
}

impl MockBackend {
    /// Every stage is granted, low-latency supported, everything succeeds.
    pub fn granting_all() -> Self {
        let state = BackendState::default();
        state.low_latency.store(true, Ordering::SeqCst);
        Self { state: Arc::new(state) }
    }

    /// Every stage fails with the error produced by `f`.
    pub fn rejecting_all(f: impl Fn(StageName) -> AcquireError + Send + Sync + 'static) -> Self {
        let backend = Self::granting_all();
        *backend.state.reject_all.lock().unwrap() = Some(Arc::new(f));
        backend
    }

    /// Make one specific stage fail with `err`.
    pub fn fail_stage(self, stage: StageName, err: AcquireError) -> Self {
        self.state.stage_failures.lock().unwrap().insert(stage, err);
        self
    }

    /// Report no low-latency facility.
    pub fn without_low_latency(self) -> Self {
        self.state.low_latency.store(false, Ordering::SeqCst);
        self
    }

    pub fn fail_module_install(self) -> Self {
        self.state.fail_module_install.store(true, Ordering::SeqCst);
        self
    }

    /// Kill every stream acquired so far when the module install runs,
    /// simulating a device dying during the asynchronous install.
    pub fn kill_streams_on_install(self) -> Self {
        self.state.kill_streams_on_install.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_low_latency_node(self) -> Self {
        self.state.fail_low_latency_node.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_periodic_node(self) -> Self {
        self.state.fail_periodic_node.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_monitor(self) -> Self {
        self.state.fail_monitor.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_output_open(self) -> Self {
        self.state.fail_output_open.store(true, Ordering::SeqCst);
        self
    }

    /// Run `f` inside every `acquire` call, while the caller is suspended on
    /// the backend.  Lets tests race transitions against acquisition.
    pub fn on_acquire(self, f: impl Fn() + Send + Sync + 'static) -> Self {
        *self.state.acquire_hook.lock().unwrap() = Some(Arc::new(f));
        self
    }

    /// Run `f` inside every module install, while the caller is suspended.
    pub fn on_module_install(self, f: impl Fn() + Send + Sync + 'static) -> Self {
        *self.state.install_hook.lock().unwrap() = Some(Arc::new(f));
        self
    }

    // ---- Assertions --------------------------------------------------------

    /// Stages passed to `acquire`, in call order.
    pub fn acquire_log(&self) -> Vec<StageName> {
        self.state.acquire_log.lock().unwrap().clone()
    }

    pub fn module_installs(&self) -> usize {
        self.state.module_installs.load(Ordering::SeqCst)
    }

    /// Monitor sinks currently open (opened minus closed).
    pub fn monitors_open(&self) -> usize {
        self.state.monitors_open.load(Ordering::SeqCst)
    }

    /// Processing nodes currently attached.
    pub fn nodes_live(&self) -> usize {
        self.state.nodes_live.load(Ordering::SeqCst)
    }

    /// Total streams handed out so far.
    pub fn streams_acquired(&self) -> usize {
        self.state.stream_flags.lock().unwrap().len()
    }

    /// Streams handed out that have not been stopped or killed.
    pub fn live_streams(&self) -> usize {
        self.state
            .stream_flags
            .lock()
            .unwrap()
            .iter()
            .filter(|flag| flag.load(Ordering::SeqCst))
            .count()
    }

    /// Kill all streams handed out so far.
    pub fn kill_all_streams(&self) {
        for flag in self.state.stream_flags.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Deliver one captured frame to every attached processing node.
    pub fn push_frames(&self, frame: Vec<f32>) {
        for sender in self.state.frame_senders.lock().unwrap().iter().flatten() {
            let _ = sender.send(frame.clone());
        }
    }

    /// The shared output sink this backend's [`OutputFactory`] hands out.
    pub fn output_sink(&self) -> Arc<MockOutputSink> {
        let mut slot = self.state.output.lock().unwrap();
        slot.get_or_insert_with(|| Arc::new(MockOutputSink::new()))
            .clone()
    }

    fn stage_for(request: &CaptureRequest) -> StageName {
        STAGES
            .iter()
            .find(|s| &s.request == request)
            .map(|s| s.name)
            .expect("acquire called with a request not in the ladder table")
    }
}

#[async_trait]
impl CaptureBackend for MockBackend {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Box<dyn DeviceStream>, AcquireError> {
        let stage = Self::stage_for(request);
        self.state.acquire_log.lock().unwrap().push(stage);

        // Clone the hook out of the lock before running caller code.
        let hook = self.state.acquire_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }

        if let Some(reject) = self.state.reject_all.lock().unwrap().clone() {
            return Err(reject(stage));
        }
        if let Some(err) = self.state.stage_failures.lock().unwrap().get(&stage) {
            return Err(err.clone());
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.state.stream_flags.lock().unwrap().push(alive.clone());
        Ok(Box::new(MockStream {
            alive,
            backend: self.state.clone(),
        }))
    }

    fn supports_low_latency(&self) -> bool {
        self.state.low_latency.load(Ordering::SeqCst)
    }

    async fn install_low_latency_module(&self) -> Result<(), SetupError> {
        self.state.module_installs.fetch_add(1, Ordering::SeqCst);
        let hook = self.state.install_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        if self.state.kill_streams_on_install.load(Ordering::SeqCst) {
            self.kill_all_streams();
        }
        if self.state.fail_module_install.load(Ordering::SeqCst) {
            return Err(SetupError::ModuleInstall("scripted install failure".into()));
        }
        Ok(())
    }

    fn open_monitor_sink(&self) -> Result<Box<dyn MonitorSink>, SetupError> {
        if self.state.fail_monitor.load(Ordering::SeqCst) {
            return Err(SetupError::MonitorSink("scripted monitor failure".into()));
        }
        self.state.monitors_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMonitor {
            backend: self.state.clone(),
            closed: false,
        }))
    }
}

impl OutputFactory for MockBackend {
    fn open_output(&self) -> Result<Arc<dyn OutputSink>, PlaybackError> {
        if self.state.fail_output_open.load(Ordering::SeqCst) {
            return Err(PlaybackError::Sink("scripted output-open failure".into()));
        }
        Ok(self.output_sink())
    }
}

// ---------------------------------------------------------------------------
// MockStream / MockNode / MockMonitor
// ---------------------------------------------------------------------------

pub struct MockStream {
    alive: Arc<AtomicBool>,
    backend: Arc<BackendState>,
}

impl MockStream {
    fn start_node(
        &self,
        fail: bool,
        kind: &str,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        if fail {
            return Err(SetupError::NodeStart(format!("scripted {kind} node failure")));
        }
        self.backend.nodes_live.fetch_add(1, Ordering::SeqCst);
        let slot = {
            let mut senders = self.backend.frame_senders.lock().unwrap();
            senders.push(Some(frames));
            senders.len() - 1
        };
        Ok(Box::new(MockNode {
            backend: self.backend.clone(),
            slot,
            detached: false,
        }))
    }
}

impl DeviceStream for MockStream {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn start_low_latency_node(
        &mut self,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        let fail = self.backend.fail_low_latency_node.load(Ordering::SeqCst);
        self.start_node(fail, "low-latency", frames)
    }

    fn start_periodic_node(
        &mut self,
        _buffer_size: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        let fail = self.backend.fail_periodic_node.load(Ordering::SeqCst);
        self.start_node(fail, "periodic", frames)
    }
}

struct MockNode {
    backend: Arc<BackendState>,
    slot: usize,
    detached: bool,
}

impl ProcessingNode for MockNode {
    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.backend.nodes_live.fetch_sub(1, Ordering::SeqCst);
            // Drop this node's sender so pump threads see a disconnect.
            self.backend.frame_senders.lock().unwrap()[self.slot] = None;
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.detach();
    }
}

struct MockMonitor {
    backend: Arc<BackendState>,
    closed: bool,
}

impl MonitorSink for MockMonitor {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.backend.monitors_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// MockOutputSink
// ---------------------------------------------------------------------------

/// A scheduled-call record the tests assert against.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    pub start_secs: f64,
    pub rate: f64,
    pub duration_secs: f64,
}

struct SegmentState {
    on_ended: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stopped: AtomicBool,
}

/// Output sink with a manually advanced clock.
pub struct MockOutputSink {
    clock: Mutex<f64>,
    calls: Mutex<Vec<ScheduledCall>>,
    segments: Mutex<Vec<Arc<SegmentState>>>,
    fail_schedule: AtomicBool,
}

impl MockOutputSink {
    pub fn new() -> Self {
        Self {
            clock: Mutex::new(0.0),
            calls: Mutex::new(Vec::new()),
            segments: Mutex::new(Vec::new()),
            fail_schedule: AtomicBool::new(false),
        }
    }

    pub fn set_clock(&self, secs: f64) {
        *self.clock.lock().unwrap() = secs;
    }

    pub fn set_fail_schedule(&self, fail: bool) {
        self.fail_schedule.store(fail, Ordering::SeqCst);
    }

    pub fn scheduled_calls(&self) -> Vec<ScheduledCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Fire the natural-completion handler of segment `index`.
    pub fn finish_segment(&self, index: usize) {
        let state = self.segments.lock().unwrap()[index].clone();
        let on_ended = state.on_ended.lock().unwrap().take();
        if let Some(on_ended) = on_ended {
            on_ended();
        }
    }

    /// How many scheduled segments have had `stop` called on their handle.
    pub fn stopped_count(&self) -> usize {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.stopped.load(Ordering::SeqCst))
            .count()
    }
}

impl OutputSink for MockOutputSink {
    fn clock_secs(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn schedule(
        &self,
        audio: DecodedAudio,
        start_secs: f64,
        rate: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn ScheduledSegment>, PlaybackError> {
        if self.fail_schedule.load(Ordering::SeqCst) {
            return Err(PlaybackError::Sink("scripted schedule failure".into()));
        }
        self.calls.lock().unwrap().push(ScheduledCall {
            start_secs,
            rate,
            duration_secs: audio.duration_secs(),
        });
        let state = Arc::new(SegmentState {
            on_ended: Mutex::new(Some(on_ended)),
            stopped: AtomicBool::new(false),
        });
        self.segments.lock().unwrap().push(state.clone());
        Ok(Box::new(MockSegment { state }))
    }
}

struct MockSegment {
    state: Arc<SegmentState>,
}

impl ScheduledSegment for MockSegment {
    fn stop(&mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        // A stopped segment never fires its natural-completion handler.
        self.state.on_ended.lock().unwrap().take();
    }
}
