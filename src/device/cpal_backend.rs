//! cpal implementation of the capture-side backend traits.
//!
//! cpal streams are not `Send`, so every node (and the monitor sink) runs on
//! its own dedicated thread that builds the stream, plays it, and parks
//! until the handle asks it to shut down.  The handles themselves are plain
//! `Send` values the async controller can own.
//!
//! The backend normalises whatever format the device delivers (f32/i16/u16,
//! any channel count, any rate) to the pipeline's 16 kHz mono `f32` before
//! frames enter the channel, so the encoder never sees device-specific data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use crate::audio::constraints::{AcquireError, CaptureRequest};
use crate::audio::path::SetupError;
use crate::audio::resample::{downmix_to_mono, StreamResampler};

use super::{CaptureBackend, DeviceStream, MonitorSink, ProcessingNode};

/// How long to wait for a node thread to report stream startup.
const NODE_START_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CpalBackend
// ---------------------------------------------------------------------------

/// Capture backend over the system's default cpal host.
pub struct CpalBackend {
    preferred_device: Option<String>,
}

impl CpalBackend {
    /// Use the system default input device.
    pub fn new() -> Self {
        Self {
            preferred_device: None,
        }
    }

    /// Force a specific input device by name, for hosts exposing several.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            preferred_device: Some(name.into()),
        }
    }

    /// List input device names, for device pickers.
    pub fn list_devices() -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn find_device(&self) -> Result<cpal::Device, AcquireError> {
        let host = cpal::default_host();
        match &self.preferred_device {
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| AcquireError::Other(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or(AcquireError::DeviceNotFound)
            }
            None => host
                .default_input_device()
                .ok_or(AcquireError::DeviceNotFound),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for CpalBackend {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Box<dyn DeviceStream>, AcquireError> {
        let device = self.find_device()?;
        let default = device
            .default_input_config()
            .map_err(classify_default_config_error)?;

        validate_request(&device, request)?;
        if request.echo_cancellation.is_some()
            || request.noise_suppression.is_some()
            || request.auto_gain.is_some()
        {
            // cpal exposes no DSP control; the flags are advisory here and
            // only meaningful to backends that honor them.
            log::debug!("capture DSP flags are advisory on the cpal host");
        }

        let channels = request.channels.unwrap_or(default.channels());
        let sample_rate = request.sample_rate.unwrap_or(default.sample_rate().0);
        let sample_format = match request.sample_bits {
            Some(16) => SampleFormat::I16,
            _ => default.sample_format(),
        };

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        log::debug!(
            "cpal stream granted: {channels}ch {sample_rate}Hz {sample_format:?}"
        );

        Ok(Box::new(CpalDeviceStream {
            device,
            config,
            sample_format,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }

    fn supports_low_latency(&self) -> bool {
        true
    }

    async fn install_low_latency_module(&self) -> Result<(), SetupError> {
        // cpal needs no out-of-process module; the dedicated node threads are
        // spawned per stream.  The guard still spares backends that do have
        // an install step from repeating it.
        Ok(())
    }

    fn open_monitor_sink(&self) -> Result<Box<dyn MonitorSink>, SetupError> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), SetupError>>();

        let join = std::thread::Builder::new()
            .name("monitor-sink".into())
            .spawn(move || run_monitor_sink(ready_tx, shutdown_rx))
            .map_err(|e| SetupError::MonitorSink(e.to_string()))?;

        let join = wait_ready(ready_rx, join, SetupError::MonitorSink)?;
        Ok(Box::new(CpalMonitorSink {
            thread: Some(NodeThread {
                shutdown: shutdown_tx,
                join: Some(join),
            }),
        }))
    }
}

// ---------------------------------------------------------------------------
// CpalDeviceStream
// ---------------------------------------------------------------------------

/// One granted input configuration.  The actual cpal stream is built lazily
/// by whichever processing node attaches, on that node's thread.
pub struct CpalDeviceStream {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    alive: Arc<AtomicBool>,
}

impl CpalDeviceStream {
    fn start_node(
        &mut self,
        delivery: Delivery,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        if !self.is_live() {
            return Err(SetupError::NodeStart("capture stream is not live".into()));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), SetupError>>();

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let alive = Arc::clone(&self.alive);
        let forwarder = FrameForwarder::new(
            frames,
            delivery,
            config.channels,
            config.sample_rate.0,
        );

        let name = match delivery {
            Delivery::Immediate => "low-latency-node",
            Delivery::Fixed(_) => "periodic-node",
        };

        let join = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                run_capture_node(
                    device,
                    config,
                    sample_format,
                    alive,
                    forwarder,
                    ready_tx,
                    shutdown_rx,
                )
            })
            .map_err(|e| SetupError::NodeStart(e.to_string()))?;

        wait_ready(ready_rx, join, SetupError::NodeStart).map(|thread| {
            Box::new(CpalProcessingNode {
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }) as Box<dyn ProcessingNode>
        })
    }
}

impl DeviceStream for CpalDeviceStream {
    fn is_live(&self) -> bool {
        // Ask the host, not a cached flag: the device may have been
        // unplugged or revoked since acquisition.
        self.alive.load(Ordering::Acquire) && self.device.default_input_config().is_ok()
    }

    fn stop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }

    fn start_low_latency_node(
        &mut self,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        self.start_node(Delivery::Immediate, frames)
    }

    fn start_periodic_node(
        &mut self,
        buffer_size: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError> {
        self.start_node(Delivery::Fixed(buffer_size.max(1)), frames)
    }
}

// ---------------------------------------------------------------------------
// Node / monitor handles
// ---------------------------------------------------------------------------

struct CpalProcessingNode {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessingNode for CpalProcessingNode {
    fn detach(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalProcessingNode {
    fn drop(&mut self) {
        self.detach();
    }
}

struct CpalMonitorSink {
    thread: Option<NodeThread>,
}

impl MonitorSink for CpalMonitorSink {
    fn close(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
        }
    }
}

impl Drop for CpalMonitorSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// A parked stream thread plus the channel that un-parks it.
struct NodeThread {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl NodeThread {
    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Stream threads
// ---------------------------------------------------------------------------

/// Wait for a spawned stream thread to confirm startup, joining it on error.
fn wait_ready(
    ready_rx: mpsc::Receiver<Result<(), SetupError>>,
    join: JoinHandle<()>,
    timeout_err: impl FnOnce(String) -> SetupError,
) -> Result<JoinHandle<()>, SetupError> {
    match ready_rx.recv_timeout(NODE_START_TIMEOUT) {
        Ok(Ok(())) => Ok(join),
        Ok(Err(err)) => {
            let _ = join.join();
            Err(err)
        }
        Err(_) => {
            // Thread is wedged or died without reporting; don't block on it.
            Err(timeout_err("stream thread did not start in time".into()))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture_node(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    alive: Arc<AtomicBool>,
    mut forwarder: FrameForwarder,
    ready_tx: mpsc::Sender<Result<(), SetupError>>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let err_alive = Arc::clone(&alive);
    let err_fn = move |err: cpal::StreamError| {
        log::warn!("capture stream error: {err}");
        err_alive.store(false, Ordering::Release);
    };

    // Convert every supported sample type to f32 up front so the forwarder
    // stays format-agnostic.
    let data_alive = Arc::clone(&alive);
    let built = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if data_alive.load(Ordering::Acquire) {
                    forwarder.push(data);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if data_alive.load(Ordering::Acquire) {
                    let as_f32: Vec<f32> =
                        data.iter().map(|&s| f32::from(s) / 32_768.0).collect();
                    forwarder.push(&as_f32);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                if data_alive.load(Ordering::Acquire) {
                    let as_f32: Vec<f32> = data
                        .iter()
                        .map(|&s| (f32::from(s) - 32_768.0) / 32_768.0)
                        .collect();
                    forwarder.push(&as_f32);
                }
            },
            err_fn,
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(SetupError::NodeStart(format!(
                "unsupported sample format: {other:?}"
            ))));
            return;
        }
    };

    let stream = match built {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(SetupError::NodeStart(err.to_string())));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(SetupError::NodeStart(err.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    // Park until detach; the stream lives (and stays on this thread) here.
    let _ = shutdown_rx.recv();
    drop(stream);
}

fn run_monitor_sink(
    ready_tx: mpsc::Sender<Result<(), SetupError>>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready_tx.send(Err(SetupError::MonitorSink(
            "no output device for monitor sink".into(),
        )));
        return;
    };
    let config = match device.default_output_config() {
        Ok(config) => config.config(),
        Err(err) => {
            let _ = ready_tx.send(Err(SetupError::MonitorSink(err.to_string())));
            return;
        }
    };

    // Pure silence; the sink exists only to keep the engine clock pumping
    // and must never be audible.
    let built = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            data.fill(0.0);
        },
        |err| log::warn!("monitor sink stream error: {err}"),
        None,
    );

    let stream = match built {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(SetupError::MonitorSink(err.to_string())));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(SetupError::MonitorSink(err.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    let _ = shutdown_rx.recv();
    drop(stream);
}

// ---------------------------------------------------------------------------
// FrameForwarder
// ---------------------------------------------------------------------------

/// How the node hands buffers to the frame channel.
#[derive(Clone, Copy)]
enum Delivery {
    /// Forward each driver buffer as soon as it arrives (low-latency path).
    Immediate,
    /// Accumulate and emit fixed-size mono blocks (periodic path).
    Fixed(usize),
}

/// Normalises interleaved device samples to 16 kHz mono and forwards them
/// according to the configured [`Delivery`].
///
/// Driver buffers are slices of one continuous stream, so resampling goes
/// through a [`StreamResampler`] that keeps interpolation phase across
/// callbacks — per-buffer resampling would drift at fractional ratios.
struct FrameForwarder {
    frames: mpsc::Sender<Vec<f32>>,
    delivery: Delivery,
    pending: Vec<f32>,
    channels: u16,
    resampler: StreamResampler,
}

impl FrameForwarder {
    fn new(
        frames: mpsc::Sender<Vec<f32>>,
        delivery: Delivery,
        channels: u16,
        source_rate: u32,
    ) -> Self {
        Self {
            frames,
            delivery,
            pending: Vec::new(),
            channels,
            resampler: StreamResampler::to_16k(source_rate),
        }
    }

    fn push(&mut self, interleaved: &[f32]) {
        let mono = downmix_to_mono(interleaved, self.channels);
        let normalized = self.resampler.push(&mono);
        if normalized.is_empty() {
            return;
        }

        match self.delivery {
            Delivery::Immediate => {
                // Receiver gone means the pump shut down first; drop quietly.
                let _ = self.frames.send(normalized);
            }
            Delivery::Fixed(size) => {
                self.pending.extend_from_slice(&normalized);
                while self.pending.len() >= size {
                    let block: Vec<f32> = self.pending.drain(..size).collect();
                    let _ = self.frames.send(block);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_default_config_error(err: cpal::DefaultStreamConfigError) -> AcquireError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AcquireError::DeviceBusy,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            AcquireError::ConstraintNotSatisfiable("stream type not supported".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_message(err.to_string())
        }
    }
}

fn classify_supported_configs_error(err: cpal::SupportedStreamConfigsError) -> AcquireError {
    match err {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => AcquireError::DeviceBusy,
        cpal::SupportedStreamConfigsError::InvalidArgument => {
            AcquireError::Other("invalid stream configuration query".into())
        }
        cpal::SupportedStreamConfigsError::BackendSpecific { err } => {
            classify_backend_message(err.to_string())
        }
    }
}

/// Backend-specific errors only carry a message; recognise the permission
/// wording the common hosts use.
fn classify_backend_message(message: String) -> AcquireError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        AcquireError::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        AcquireError::DeviceBusy
    } else {
        AcquireError::Other(message)
    }
}

/// Check the hard constraints (channels / rate / bits) against what the
/// device actually supports.  DSP flags are advisory and never rejected.
fn validate_request(device: &cpal::Device, request: &CaptureRequest) -> Result<(), AcquireError> {
    if request.channels.is_none() && request.sample_rate.is_none() && request.sample_bits.is_none()
    {
        return Ok(());
    }

    let supported = device
        .supported_input_configs()
        .map_err(classify_supported_configs_error)?;

    for range in supported {
        let channels_ok = request.channels.map_or(true, |c| range.channels() == c);
        let rate_ok = request.sample_rate.map_or(true, |r| {
            range.min_sample_rate().0 <= r && r <= range.max_sample_rate().0
        });
        let bits_ok = request.sample_bits.map_or(true, |b| match b {
            16 => range.sample_format() == SampleFormat::I16,
            32 => range.sample_format() == SampleFormat::F32,
            _ => false,
        });
        if channels_ok && rate_ok && bits_ok {
            return Ok(());
        }
    }

    Err(AcquireError::ConstraintNotSatisfiable(format!(
        "no supported config matches channels={:?} rate={:?} bits={:?}",
        request.channels, request.sample_rate, request.sample_bits
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
