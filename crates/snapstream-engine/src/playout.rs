//! Deadline-ordered playout buffer.
//!
//! Producer side (decode thread) appends PCM chunks keyed by their
//! server-clock deadline. Consumer side is the audio callback: it walks the
//! head of the queue against the callback's own playout deadline, dropping
//! what is already late, silence-filling gaps, and consuming what lines up.
//!
//! ## Real-time discipline
//! The callback never blocks: it uses `try_lock` and renders silence on a
//! missed lock, reads the clock offset and all settings through atomics, and
//! allocates nothing. The producer side uses the plain mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock::ClockSync;
use crate::config::PlayoutConfig;
use crate::decode::AudioFormat;
use crate::diagnostics::Diagnostics;
use crate::settings::{SharedSettings, UserControls};
use crate::sink::FrameSource;

/// Decoded PCM tagged with the server-clock deadline of its first sample.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub deadline_us: i64,
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
}

impl PcmChunk {
    fn frames(&self, channels: usize) -> usize {
        self.samples.len() / channels
    }
}

struct Queue {
    chunks: VecDeque<PcmChunk>,
    /// Frames already consumed from the head chunk.
    head_offset: usize,
    /// Fractional consumption position for drift compensation.
    frac: f64,
}

pub struct PlayoutBuffer {
    format: AudioFormat,
    cfg: PlayoutConfig,
    clock: Arc<ClockSync>,
    settings: Arc<SharedSettings>,
    controls: Arc<UserControls>,
    diag: Arc<Diagnostics>,
    queue: Mutex<Queue>,
    /// Client-clock µs when the current empty-buffer streak began, or -1.
    underrun_since_us: AtomicI64,
}

impl PlayoutBuffer {
    pub fn new(
        format: AudioFormat,
        cfg: PlayoutConfig,
        clock: Arc<ClockSync>,
        settings: Arc<SharedSettings>,
        controls: Arc<UserControls>,
        diag: Arc<Diagnostics>,
    ) -> Self {
        Self {
            format,
            cfg,
            clock,
            settings,
            controls,
            diag,
            queue: Mutex::new(Queue {
                chunks: VecDeque::new(),
                head_offset: 0,
                frac: 0.0,
            }),
            underrun_since_us: AtomicI64::new(-1),
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn us_per_frame(&self) -> f64 {
        1_000_000.0 / self.format.sample_rate as f64
    }

    /// Append a decoded chunk, preserving deadline order.
    ///
    /// Chunks whose deadline is already further past than the eviction
    /// threshold are dropped; a buffer above `max_ms` sheds from the front.
    pub fn enqueue(&self, chunk: PcmChunk) {
        let channels = self.format.channels as usize;
        if chunk.samples.is_empty() || channels == 0 {
            return;
        }

        if self.clock.is_synced() {
            let horizon = self.clock.server_now_us() - self.cfg.evict_threshold_ms as i64 * 1000;
            if chunk.deadline_us < horizon {
                self.diag.add(&self.diag.late_drops, 1);
                tracing::debug!(
                    deadline_us = chunk.deadline_us,
                    behind_us = horizon - chunk.deadline_us,
                    "dropped late chunk at enqueue"
                );
                return;
            }
        }

        let mut q = self.queue.lock().unwrap();
        if let Some(last) = q.chunks.back() {
            if chunk.deadline_us < last.deadline_us {
                tracing::warn!(
                    deadline_us = chunk.deadline_us,
                    tail_us = last.deadline_us,
                    "out-of-order chunk dropped"
                );
                return;
            }
        }
        q.chunks.push_back(chunk);

        let max_frames =
            (self.cfg.max_ms as u64 * self.format.sample_rate as u64 / 1000) as usize;
        while buffered_frames(&q, channels) > max_frames {
            q.chunks.pop_front();
            q.head_offset = 0;
            q.frac = 0.0;
            self.diag.add(&self.diag.overflow_drops, 1);
        }
    }

    /// Buffered audio ahead of the consumer, in milliseconds.
    pub fn buffered_ms(&self) -> u64 {
        let channels = self.format.channels as usize;
        let q = self.queue.lock().unwrap();
        buffered_frames(&q, channels) as u64 * 1000 / self.format.sample_rate as u64
    }

    /// How long the consumer has been running on empty, in milliseconds.
    pub fn stalled_for_ms(&self) -> u64 {
        let since = self.underrun_since_us.load(Ordering::Relaxed);
        if since < 0 {
            return 0;
        }
        ((self.clock.client_now_us() - since).max(0) / 1000) as u64
    }

    /// Render `out.len() / channels` frames due to become audible at
    /// `host_deadline_us` (client clock). Never blocks.
    pub fn render(&self, out: &mut [f32], host_deadline_us: i64) {
        out.fill(0.0);
        if self.controls.is_paused() || !self.clock.is_synced() {
            // Paused playback keeps the buffer intact; unsynced playback has
            // no meaningful deadline to compare against yet.
            return;
        }

        let Ok(mut q) = self.queue.try_lock() else {
            return;
        };

        let channels = self.format.channels as usize;
        let frames_wanted = out.len() / channels;
        let upf = self.us_per_frame();
        let gain = self.settings.gain();

        // Server-clock instant the first rendered frame will be heard,
        // shifted by the server-assigned and user latency corrections.
        let mut cursor = (host_deadline_us + self.clock.offset_us()
            + self.settings.latency_us()
            - self.controls.user_latency_us()) as f64;

        let drift = self.clock.drift_ppm();
        let ratio = if drift.abs() > self.cfg.drift_deadband_ppm {
            1.0 + drift / 1e6
        } else {
            1.0
        };

        let mut out_frame = 0usize;
        let mut copied_any = false;
        while out_frame < frames_wanted {
            let Some(head) = q.chunks.front() else {
                // Empty buffer: everything left is underrun silence.
                let missing = frames_wanted - out_frame;
                self.note_underrun(missing as f64 * upf, true);
                return;
            };
            let head_frames = head.frames(channels);
            let head_start = head.deadline_us as f64 + q.head_offset as f64 * upf;
            let head_end = head.deadline_us as f64 + head_frames as f64 * upf;

            if head_end <= cursor {
                // Entire remainder of this chunk missed its deadline.
                let late = head_frames - q.head_offset;
                self.diag.add(&self.diag.sink_late_frames, late as u64);
                q.chunks.pop_front();
                q.head_offset = 0;
                q.frac = 0.0;
                continue;
            }

            if head_start > cursor + upf {
                // Head is in the future: silence-fill the gap.
                let gap_frames = ((head_start - cursor) / upf) as usize;
                let fill = gap_frames.min(frames_wanted - out_frame);
                self.note_underrun(fill as f64 * upf, false);
                out_frame += fill;
                cursor += fill as f64 * upf;
                continue;
            }

            if cursor - head_start > upf {
                // Head started in the past: skip the frames already missed.
                let skip = (((cursor - head_start) / upf) as usize)
                    .min(head_frames - q.head_offset);
                q.head_offset += skip;
                self.diag.add(&self.diag.sink_late_frames, skip as u64);
                if q.head_offset >= head_frames {
                    q.chunks.pop_front();
                    q.head_offset = 0;
                    q.frac = 0.0;
                }
                continue;
            }

            // Aligned: copy with the drift-biased consumption ratio.
            let head = q.chunks.front().unwrap();
            let mut offset = q.head_offset;
            let mut frac = q.frac;
            while out_frame < frames_wanted && offset < head_frames {
                let i0 = offset;
                let i1 = (offset + 1).min(head_frames - 1);
                let t = frac as f32;
                for ch in 0..channels {
                    let a = head.samples[i0 * channels + ch];
                    let b = head.samples[i1 * channels + ch];
                    out[out_frame * channels + ch] = (a + (b - a) * t) * gain;
                }
                frac += ratio;
                while frac >= 1.0 {
                    frac -= 1.0;
                    offset += 1;
                }
                out_frame += 1;
                cursor += upf;
            }
            copied_any = true;
            q.head_offset = offset;
            q.frac = frac;
            if q.head_offset >= head_frames {
                q.chunks.pop_front();
                q.head_offset = 0;
                q.frac = 0.0;
            }
        }

        if copied_any {
            self.underrun_since_us.store(-1, Ordering::Relaxed);
            self.diag.add(&self.diag.frames_played, out_frame as u64);
        }
    }

    fn note_underrun(&self, silence_us: f64, empty: bool) {
        self.diag.add(&self.diag.underrun_us, silence_us as u64);
        if empty {
            self.diag.add(&self.diag.underrun_events, 1);
            let now = self.clock.client_now_us();
            let _ = self.underrun_since_us.compare_exchange(
                -1,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }
}

impl FrameSource for PlayoutBuffer {
    fn channels(&self) -> u16 {
        self.format.channels
    }

    fn fill(&self, out: &mut [f32], host_deadline_us: i64) {
        self.render(out, host_deadline_us);
    }
}

fn buffered_frames(q: &Queue, channels: usize) -> usize {
    let total: usize = q.chunks.iter().map(|c| c.frames(channels)).sum();
    total.saturating_sub(q.head_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::PlayoutConfig;

    fn fixture() -> (Arc<ClockSync>, PlayoutBuffer) {
        let clock = Arc::new(ClockSync::new(Arc::new(MonotonicClock::new())));
        // Zero offset, zero latency: client and server clocks coincide.
        clock.update(0, 0, 0, 0);
        let buf = PlayoutBuffer::new(
            AudioFormat {
                sample_rate: 48_000,
                channels: 2,
                bits_per_sample: 16,
            },
            PlayoutConfig::default(),
            clock.clone(),
            Arc::new(SharedSettings::new()),
            Arc::new(UserControls::default()),
            Arc::new(Diagnostics::default()),
        );
        (clock, buf)
    }

    fn chunk(deadline_us: i64, frames: usize, value: f32) -> PcmChunk {
        PcmChunk {
            deadline_us,
            samples: vec![value; frames * 2],
        }
    }

    #[test]
    fn consumes_chunks_in_deadline_order() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 500_000;
        buf.enqueue(chunk(base, 480, 0.1));
        buf.enqueue(chunk(base + 10_000, 480, 0.2));
        buf.enqueue(chunk(base + 20_000, 480, 0.3));

        let mut out = vec![0.0f32; 480 * 2];
        buf.render(&mut out, base);
        assert!(out.iter().all(|&s| (s - 0.1).abs() < 1e-6));
        buf.render(&mut out, base + 10_000);
        assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
        buf.render(&mut out, base + 20_000);
        assert!(out.iter().all(|&s| (s - 0.3).abs() < 1e-6));
    }

    #[test]
    fn out_of_order_enqueue_dropped() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 500_000;
        buf.enqueue(chunk(base + 10_000, 480, 0.2));
        buf.enqueue(chunk(base, 480, 0.1));
        assert_eq!(buf.buffered_ms(), 10);
    }

    #[test]
    fn late_chunk_dropped_and_counted() {
        let (clock, buf) = fixture();
        let past = clock.server_now_us() - 200_000;
        buf.enqueue(chunk(past, 480, 0.5));
        assert_eq!(buf.buffered_ms(), 0);
        assert_eq!(buf.diag.late_drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overflow_sheds_from_front() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 100_000;
        // 48 chunks of 50ms = 2.4s buffered, cap is 1s.
        for i in 0..48 {
            buf.enqueue(chunk(base + i * 50_000, 2400, 0.1));
        }
        assert!(buf.buffered_ms() <= 1000);
        assert!(buf.diag.overflow_drops.load(Ordering::Relaxed) >= 28);
    }

    #[test]
    fn gap_renders_silence_and_counts_underrun() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 500_000;
        // Head starts 5ms (240 frames) after the requested deadline.
        buf.enqueue(chunk(base + 5_000, 480, 0.25));

        let mut out = vec![1.0f32; 480 * 2];
        buf.render(&mut out, base);
        assert_eq!(out[0], 0.0);
        assert!((out[240 * 2] - 0.25).abs() < 1e-6);
        assert!(buf.diag.underrun_us.load(Ordering::Relaxed) >= 4_900);
    }

    #[test]
    fn empty_buffer_records_underrun_streak() {
        let (_clock, buf) = fixture();
        let mut out = vec![0.0f32; 128 * 2];
        buf.render(&mut out, 0);
        assert_eq!(buf.diag.underrun_events.load(Ordering::Relaxed), 1);
        assert!(buf.underrun_since_us.load(Ordering::Relaxed) >= 0);
    }

    #[test]
    fn pause_holds_buffer_and_renders_silence() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 500_000;
        buf.enqueue(chunk(base, 480, 0.5));
        buf.controls.set_paused(true);

        let mut out = vec![1.0f32; 480 * 2];
        buf.render(&mut out, base);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(buf.buffered_ms(), 10);

        buf.controls.set_paused(false);
        buf.render(&mut out, base);
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn fully_late_head_dropped_by_consumer() {
        let (clock, buf) = fixture();
        let base = clock.server_now_us() + 500_000;
        buf.enqueue(chunk(base, 480, 0.1));
        buf.enqueue(chunk(base + 10_000, 480, 0.2));

        // Ask for audio 15ms after the first chunk's deadline: chunk 1 is
        // entirely late, chunk 2 is half consumed.
        let mut out = vec![0.0f32; 480 * 2];
        buf.render(&mut out, base + 15_000);
        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!(buf.diag.sink_late_frames.load(Ordering::Relaxed) >= 480);
    }

    #[test]
    fn volume_scales_output() {
        let (clock, buf) = fixture();
        buf.settings.apply(&snapstream_proto::ServerSettings {
            buffer_ms: 0,
            latency: 0,
            volume: 50,
            muted: false,
        });
        let base = clock.server_now_us() + 500_000;
        buf.enqueue(chunk(base, 480, 0.8));
        let mut out = vec![0.0f32; 480 * 2];
        buf.render(&mut out, base);
        assert!((out[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn unsynced_clock_renders_silence() {
        let clock = Arc::new(ClockSync::new(Arc::new(MonotonicClock::new())));
        let buf = PlayoutBuffer::new(
            AudioFormat {
                sample_rate: 48_000,
                channels: 2,
                bits_per_sample: 16,
            },
            PlayoutConfig::default(),
            clock,
            Arc::new(SharedSettings::new()),
            Arc::new(UserControls::default()),
            Arc::new(Diagnostics::default()),
        );
        buf.enqueue(chunk(1_000_000, 480, 0.5));
        let mut out = vec![1.0f32; 64 * 2];
        buf.render(&mut out, 1_000_000);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
