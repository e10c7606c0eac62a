//! # Window Buffer Module
//!
//! Turns a push stream of arbitrary-length sample chunks (device callbacks,
//! network frames) into fixed-size, overlapping analysis windows.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{FollowError, Result};

/// Default window for notes above roughly C2.
pub const STANDARD_WINDOW: usize = 3072;
/// Longer window needed to resolve the bottom octave.
pub const LOW_NOTE_WINDOW: usize = 6144;
/// Default hop: ~11.6 ms at 44.1 kHz, ~86 windows per second.
pub const DEFAULT_HOP: usize = 512;

/// Window length presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowProfile {
    #[default]
    Standard,
    LowNote,
}

impl WindowProfile {
    pub fn window_size(self) -> usize {
        match self {
            WindowProfile::Standard => STANDARD_WINDOW,
            WindowProfile::LowNote => LOW_NOTE_WINDOW,
        }
    }
}

/// One immutable analysis window.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    samples: Arc<[f32]>,
    sample_rate: u32,
    /// Index of the first sample since the stream started.
    start_sample: u64,
}

impl AudioWindow {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32, start_sample: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            start_sample,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    /// Stream time of the first sample, in ms.
    pub fn start_ms(&self) -> f64 {
        samples_to_ms(self.start_sample, self.sample_rate)
    }

    /// Stream time just past the last sample, in ms.
    pub fn end_ms(&self) -> f64 {
        samples_to_ms(self.start_sample + self.samples.len() as u64, self.sample_rate)
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root mean square of a frame; 0 for an empty frame.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|&s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

pub fn samples_to_ms(samples: u64, sample_rate: u32) -> f64 {
    samples as f64 * 1000.0 / sample_rate as f64
}

/// Accumulates streamed samples and emits fixed-size, possibly overlapping windows.
#[derive(Debug)]
pub struct WindowBuffer {
    window_size: usize,
    hop_size: usize,
    sample_rate: u32,
    buffer: Vec<f32>,
    /// Stream index of `buffer[0]`.
    buffer_start: u64,
}

impl WindowBuffer {
    pub fn new(window_size: usize, hop_size: usize, sample_rate: u32) -> Result<Self> {
        if window_size == 0 {
            return Err(FollowError::config("window_size", "must be > 0"));
        }
        if hop_size == 0 || hop_size > window_size {
            return Err(FollowError::config(
                "hop_size",
                format!("must be within 1..={window_size}, got {hop_size}"),
            ));
        }
        if sample_rate == 0 {
            return Err(FollowError::config("sample_rate", "must be > 0"));
        }
        Ok(Self {
            window_size,
            hop_size,
            sample_rate,
            buffer: Vec::with_capacity(window_size * 2),
            buffer_start: 0,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Appends `samples` and returns every window that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioWindow> {
        self.buffer.extend_from_slice(samples);

        let mut windows = Vec::new();
        while self.buffer.len() >= self.window_size {
            windows.push(AudioWindow::new(
                &self.buffer[..self.window_size],
                self.sample_rate,
                self.buffer_start,
            ));
            self.buffer.drain(..self.hop_size);
            self.buffer_start += self.hop_size as u64;
        }
        windows
    }

    /// Samples currently held but not yet part of an emitted window tail.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Total samples pushed since creation.
    pub fn samples_seen(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    /// Drops buffered audio; the stream clock keeps running.
    pub fn reset(&mut self) {
        self.buffer_start += self.buffer.len() as u64;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_sizes() {
        assert!(WindowBuffer::new(0, 1, 44_100).is_err());
        assert!(WindowBuffer::new(1024, 0, 44_100).is_err());
        assert!(WindowBuffer::new(1024, 2048, 44_100).is_err());
        assert!(WindowBuffer::new(1024, 256, 0).is_err());
    }

    #[test]
    fn emits_overlapping_windows_across_chunk_boundaries() {
        let mut buf = WindowBuffer::new(8, 4, 1000).unwrap();
        let samples: Vec<f32> = (0..20).map(|i| i as f32).collect();

        let mut windows = buf.push(&samples[..5]);
        assert!(windows.is_empty());
        windows.extend(buf.push(&samples[5..]));

        // 20 samples, window 8, hop 4 -> starts at 0, 4, 8, 12
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[1].samples()[0], 4.0);
        assert_eq!(windows[3].start_sample(), 12);
        assert_eq!(windows[3].samples()[7], 19.0);
        assert!((windows[1].start_ms() - 4.0).abs() < 1e-9);
        assert!((windows[1].end_ms() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn reset_keeps_the_stream_clock() {
        let mut buf = WindowBuffer::new(4, 4, 1000).unwrap();
        buf.push(&[0.0; 6]);
        buf.reset();
        let windows = buf.push(&[1.0; 4]);
        assert_eq!(windows[0].start_sample(), 6);
    }

    #[test]
    fn rms_of_constant_frame() {
        assert!((rms(&[0.5; 16]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }
}
