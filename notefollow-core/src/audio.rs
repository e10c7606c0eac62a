//! # Audio Capture Module
//!
//! Sources of mono `f32` sample chunks for the orchestrator. Every source
//! pushes chunks into a channel from its own thread and stops
//! deterministically: once `stop` returns, nothing is sent any more.
//!
//! ## Features
//! - `CpalSource`: default input device through CPAL, mono f32 closest to
//!   44.1 kHz, multi-channel input downmixed
//! - `ReplaySource`: recorded samples in fixed chunks, optionally paced in
//!   real time (tests, files, offline replays)

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use crossbeam_channel::{bounded, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{FollowError, Result};

/// Preferred capture rate.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;
/// Default chunk length for replayed audio (~11.6 ms at 44.1 kHz).
pub const REPLAY_CHUNK: usize = 512;
/// How often a blocked replay checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

/// A push stream of mono samples.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;

    /// Starts delivering chunks into `sink`. The source drops `sink` when
    /// it runs out of audio or is stopped.
    fn start(&mut self, sink: Sender<Vec<f32>>) -> Result<()>;

    /// Stops delivery and waits for the producer thread. Idempotent.
    fn stop(&mut self);
}

/// Captures from the default input device.
///
/// `cpal::Stream` is not `Send`, so the stream is built, played and dropped
/// on a dedicated thread that lives until [`stop`](AudioSource::stop).
#[derive(Debug)]
pub struct CpalSource {
    config: cpal::StreamConfig,
    device_name: String,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSource {
    /// Picks the stream configuration for the default input device.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| FollowError::Audio("no input device available".into()))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let configs = device
            .supported_input_configs()
            .map_err(|e| FollowError::Audio(e.to_string()))?
            .collect::<Vec<_>>();
        let supported = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| FollowError::Audio("no suitable f32 input format found".into()))?;

        let rate = TARGET_SAMPLE_RATE.clamp(supported.min_sample_rate().0, supported.max_sample_rate().0);
        let config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).into();
        log::info!(
            "[AUDIO] using '{device_name}' at {} Hz, {} channel(s)",
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            config,
            device_name,
            stop_tx: None,
            worker: None,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn start(&mut self, sink: Sender<Vec<f32>>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_stream(&config, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Held until stop() sends or drops the stop channel.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("[AUDIO] capture stream closed");
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(FollowError::Audio("capture thread exited during startup".into()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[AUDIO] capture thread panicked");
            }
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(config: &cpal::StreamConfig, sink: Sender<Vec<f32>>) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| FollowError::Audio("input device disappeared".into()))?;
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("[AUDIO] stream error: {err}");
    let mut sink = CaptureSink::new(sink);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let chunk = if channels == 1 {
                    data.to_vec()
                } else {
                    downmix(data, channels)
                };
                sink.push(chunk);
            },
            err_fn,
            None,
        )
        .map_err(|e| FollowError::Audio(e.to_string()))?;
    stream.play().map_err(|e| FollowError::Audio(e.to_string()))?;
    Ok(stream)
}

/// Non-blocking hand-off from the device callback. A full queue means the
/// workers are behind: the chunk is dropped and counted, and every later
/// timestamp runs early by its length.
struct CaptureSink {
    tx: Sender<Vec<f32>>,
    dropped: u64,
}

impl CaptureSink {
    fn new(tx: Sender<Vec<f32>>) -> Self {
        Self { tx, dropped: 0 }
    }

    fn push(&mut self, chunk: Vec<f32>) {
        if let Err(TrySendError::Full(chunk)) = self.tx.try_send(chunk) {
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                log::warn!(
                    "[AUDIO] capture queue full, {} chunks dropped (last {} samples)",
                    self.dropped,
                    chunk.len()
                );
            }
        }
    }
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Best f32 input configuration: fewest channels, then the rate range
/// closest to `target_rate`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let min = c.min_sample_rate().0;
            let max = c.max_sample_rate().0;
            let rate_distance = if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            };
            (c.channels(), rate_distance)
        })
}

/// Plays back a recording as a live source.
#[derive(Debug)]
pub struct ReplaySource {
    samples: Arc<[f32]>,
    sample_rate: u32,
    chunk_size: usize,
    realtime: bool,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            chunk_size: REPLAY_CHUNK,
            realtime: false,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleeps one chunk duration between chunks, like a device would.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate.max(1) as f64
    }
}

impl AudioSource for ReplaySource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: Sender<Vec<f32>>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.sample_rate == 0 {
            return Err(FollowError::config("sample_rate", "must be > 0"));
        }
        let samples = Arc::clone(&self.samples);
        let stop = Arc::clone(&self.stop);
        let chunk_size = self.chunk_size;
        let pace = self
            .realtime
            .then(|| Duration::from_secs_f64(chunk_size as f64 / self.sample_rate as f64));

        self.worker = Some(
            thread::Builder::new()
                .name("audio-replay".into())
                .spawn(move || {
                    for chunk in samples.chunks(chunk_size) {
                        if !deliver(&sink, chunk.to_vec(), &stop) {
                            break;
                        }
                        if let Some(pace) = pace {
                            thread::sleep(pace);
                        }
                    }
                    log::debug!("[AUDIO] replay finished");
                })?,
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[AUDIO] replay thread panicked");
            }
        }
    }
}

/// Sends one chunk, giving up when stopped or when the receiver is gone.
fn deliver(sink: &Sender<Vec<f32>>, mut chunk: Vec<f32>, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match sink.send_timeout(chunk, STOP_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => chunk = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn full_capture_queue_counts_dropped_chunks() {
        let (tx, rx) = bounded(1);
        let mut sink = CaptureSink::new(tx);
        sink.push(vec![0.0; 4]);
        sink.push(vec![0.0; 4]);
        sink.push(vec![0.0; 4]);
        assert_eq!(sink.dropped, 2);
        assert_eq!(rx.try_recv().unwrap().len(), 4);
        sink.push(vec![1.0; 2]);
        assert_eq!(sink.dropped, 2);
        assert_eq!(rx.try_recv().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn downmix_averages_frames() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn replay_delivers_every_sample_then_closes() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let mut source = ReplaySource::new(samples, 8000).with_chunk_size(300);
        let (tx, rx) = bounded(2);
        source.start(tx).unwrap();

        let chunks: Vec<Vec<f32>> = rx.iter().collect();
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![300, 300, 300, 100]);
        assert_eq!(chunks[3][99], 999.0);
        source.stop();
        source.stop();
    }

    #[test]
    fn stopping_a_replay_ends_delivery() {
        let mut source = ReplaySource::new(vec![0.0f32; 44_100], 44_100)
            .with_chunk_size(441)
            .realtime(true);
        let (tx, rx) = bounded(1);
        source.start(tx).unwrap();
        rx.recv().unwrap();
        source.stop();
        // Drain whatever was in flight; the channel must then be closed.
        let remaining = rx.iter().count();
        assert!(remaining <= 1);
    }
}
