//! CPAL output backend.
//!
//! The stream is built and owned by a dedicated device thread (`cpal::Stream`
//! is not `Send` on every platform), controlled over a channel. The real-time
//! callback pulls f32 frames from the [`FrameSource`] and converts to the
//! device sample format.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::clock::MonotonicClock;
use crate::decode::AudioFormat;
use crate::error::SinkError;
use crate::sink::{AudioBackend, FrameSource};

enum StreamCmd {
    Play,
    Pause,
    Stop,
}

struct StreamCtl {
    cmd_tx: Sender<StreamCmd>,
    ack_rx: Receiver<()>,
}

pub struct CpalBackend {
    device_hint: Option<String>,
    clock: Arc<MonotonicClock>,
    latency_us: Arc<AtomicU64>,
    ctl: Option<StreamCtl>,
}

impl CpalBackend {
    pub fn new(device_hint: Option<String>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            device_hint,
            clock,
            latency_us: Arc::new(AtomicU64::new(0)),
            ctl: None,
        }
    }

    fn send(&self, cmd: StreamCmd) {
        if let Some(ctl) = &self.ctl {
            let _ = ctl.cmd_tx.send(cmd);
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open(
        &mut self,
        format: &AudioFormat,
        source: Arc<dyn FrameSource>,
    ) -> Result<(), SinkError> {
        if self.ctl.is_some() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = bounded::<StreamCmd>(4);
        let (ack_tx, ack_rx) = bounded::<()>(1);
        let (result_tx, result_rx) = bounded::<Result<(), SinkError>>(1);

        let device_hint = self.device_hint.clone();
        let clock = self.clock.clone();
        let latency_us = self.latency_us.clone();
        let format = *format;

        thread::Builder::new()
            .name("snapstream-cpal".into())
            .spawn(move || {
                let stream = match build_device_stream(
                    device_hint.as_deref(),
                    &format,
                    source,
                    clock,
                    latency_us,
                ) {
                    Ok(s) => {
                        let _ = result_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                        return;
                    }
                };
                // Hold the stream alive until told to stop; dropping it here
                // guarantees no callback survives the Stop acknowledgment.
                use cpal::traits::StreamTrait;
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        StreamCmd::Play => {
                            if let Err(e) = stream.play() {
                                tracing::warn!("stream play failed: {e}");
                            }
                        }
                        StreamCmd::Pause => {
                            if let Err(e) = stream.pause() {
                                tracing::warn!("stream pause failed: {e}");
                            }
                        }
                        StreamCmd::Stop => break,
                    }
                }
                drop(stream);
                let _ = ack_tx.send(());
            })
            .map_err(|e| SinkError::Backend(anyhow!("spawn device thread: {e}")))?;

        match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                self.ctl = Some(StreamCtl { cmd_tx, ack_rx });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SinkError::Backend(anyhow!("device thread did not start"))),
        }
    }

    fn start(&mut self) -> Result<(), SinkError> {
        self.send(StreamCmd::Play);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            let _ = ctl.cmd_tx.send(StreamCmd::Stop);
            let _ = ctl.ack_rx.recv_timeout(Duration::from_millis(500));
        }
    }

    fn pause(&mut self) -> Result<(), SinkError> {
        self.send(StreamCmd::Pause);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), SinkError> {
        self.send(StreamCmd::Play);
        Ok(())
    }

    fn latency_us(&self) -> u64 {
        self.latency_us.load(Ordering::Relaxed)
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// List output device names for the CLI.
pub fn list_output_devices() -> anyhow::Result<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.output_devices()? {
        if let Ok(desc) = device.description() {
            names.push(desc.to_string());
        }
    }
    Ok(names)
}

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, SinkError> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| SinkError::Backend(anyhow!("no output devices: {e}")))?
        .collect();

    if let Some(needle) = needle {
        let lowered = needle.to_lowercase();
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| n.name().to_lowercase().contains(&lowered))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(SinkError::Backend(anyhow!(
            "no output device matched: {needle}"
        )));
    }

    host.default_output_device()
        .ok_or_else(|| SinkError::Backend(anyhow!("no default output device")))
}

/// Find a device config that runs the stream natively.
///
/// The engine does not resample whole streams; a device that cannot do the
/// stream's rate and channel count is a format error.
fn pick_output_config(
    device: &cpal::Device,
    format: &AudioFormat,
) -> Result<cpal::SupportedStreamConfig, SinkError> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| SinkError::Backend(anyhow!("query output configs: {e}")))?;

    let mut best: Option<(u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if range.channels() != format.channels {
            continue;
        }
        let rate: cpal::SampleRate = format.sample_rate;
        if rate < range.min_sample_rate() || rate > range.max_sample_rate() {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        let cfg = range.with_sample_rate(rate);
        if best.as_ref().map(|(r, _)| rank > *r).unwrap_or(true) {
            best = Some((rank, cfg));
        }
    }

    best.map(|(_, cfg)| cfg).ok_or_else(|| {
        SinkError::FormatUnsupported(format!(
            "{} Hz / {} ch not supported by device",
            format.sample_rate, format.channels
        ))
    })
}

fn sample_format_rank(fmt: cpal::SampleFormat) -> u8 {
    match fmt {
        cpal::SampleFormat::F32 => 4,
        cpal::SampleFormat::I32 => 3,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 1,
        _ => 0,
    }
}

fn build_device_stream(
    device_hint: Option<&str>,
    format: &AudioFormat,
    source: Arc<dyn FrameSource>,
    clock: Arc<MonotonicClock>,
    latency_us: Arc<AtomicU64>,
) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let device = pick_device(&host, device_hint)?;
    if let Ok(desc) = device.description() {
        tracing::info!(device = %desc, "output device");
    }
    let supported = pick_output_config(&device, format)?;
    let stream_config: cpal::StreamConfig = supported.config();

    match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, source, clock, latency_us)
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(&device, &stream_config, source, clock, latency_us)
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, source, clock, latency_us)
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, source, clock, latency_us)
        }
        other => Err(SinkError::FormatUnsupported(format!(
            "device sample format {other:?}"
        ))),
    }
}

/// Type-specialized stream builder.
///
/// The callback pulls into a preallocated f32 scratch buffer and converts to
/// the device format. It reads the clock and latency through atomics only.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    source: Arc<dyn FrameSource>,
    clock: Arc<MonotonicClock>,
    latency_us: Arc<AtomicU64>,
) -> Result<cpal::Stream, SinkError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = vec![0.0f32; 16_384 * channels];

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                let ts = info.timestamp();
                let latency = ts
                    .playback
                    .duration_since(&ts.callback)
                    .unwrap_or_default();
                let lat_us = latency.as_micros() as u64;
                latency_us.store(lat_us, Ordering::Relaxed);

                if data.len() > scratch.len() {
                    // Device grew its buffer; a one-off resize beats writing
                    // a torn frame forever.
                    scratch.resize(data.len(), 0.0);
                }
                let out = &mut scratch[..data.len()];
                let host_deadline_us = clock.now_us() + lat_us as i64;
                source.fill(out, host_deadline_us);

                for (dst, &src) in data.iter_mut().zip(out.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<f32>(src);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| SinkError::Backend(anyhow!("build output stream: {e}")))?;

    Ok(stream)
}
