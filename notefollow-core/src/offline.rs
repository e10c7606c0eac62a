//! # Offline Analysis Module
//!
//! One-shot transcription of a whole recording, and comparison of two
//! transcriptions. Used for ground-truth checks against a reference
//! transcription of the same audio.
//!
//! ## Features
//! - Full-track analysis on a worker thread, bounded by a timeout; on expiry
//!   the worker is cancelled and no partial result is returned
//! - Monophonic (Lite) or polyphonic (Pro) detection per request
//! - Greedy one-to-one onset matching with precision / recall / F1

use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{FollowError, Result};
use crate::events::{IdAllocator, NoteEvent, NoteSignal};
use crate::lite::LitePipeline;
use crate::remote::ProPipeline;

/// Samples processed between two cancellation checks.
const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineMode {
    #[default]
    Monophonic,
    Polyphonic,
}

/// Transcribes `samples` into confirmed notes with their offsets.
///
/// # Returns
/// * `Ok(events)` - confirmed notes in onset order
/// * `Err(FollowError::Timeout)` - the analysis did not finish in `timeout`
pub fn analyze_track(
    samples: impl Into<Arc<[f32]>>,
    sample_rate: u32,
    config: &EngineConfig,
    mode: OfflineMode,
    timeout: Duration,
) -> Result<Vec<NoteEvent>> {
    config.validate()?;
    let samples = samples.into();
    let ids = IdAllocator::new();
    let mut analyzer = match mode {
        OfflineMode::Monophonic => Analyzer::Lite(LitePipeline::new(&config.lite, sample_rate, ids)?),
        OfflineMode::Polyphonic => Analyzer::Pro(ProPipeline::new(&config.pro, sample_rate, ids)?),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let (result_tx, result_rx) = bounded(1);
    let worker_cancel = Arc::clone(&cancel);
    let started = Instant::now();
    let worker = thread::Builder::new()
        .name("offline-analysis".into())
        .spawn(move || {
            let mut collector = Collector::default();
            for chunk in samples.chunks(CHUNK) {
                if worker_cancel.load(Ordering::Relaxed) {
                    return;
                }
                collector.extend(analyzer.process(chunk));
            }
            collector.extend(analyzer.flush());
            let _ = result_tx.send(collector.finish());
        })?;

    match result_rx.recv_timeout(timeout) {
        Ok(events) => {
            let _ = worker.join();
            log::info!(
                "[OFFLINE] {} notes in {:.0} ms",
                events.len(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            Ok(events)
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            log::warn!("[OFFLINE] analysis timed out after {timeout:?}, cancelled");
            Err(FollowError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
            Err(FollowError::ChannelClosed)
        }
    }
}

enum Analyzer {
    Lite(LitePipeline),
    Pro(ProPipeline),
}

impl Analyzer {
    fn process(&mut self, samples: &[f32]) -> Vec<NoteSignal> {
        match self {
            Analyzer::Lite(lite) => lite.process(samples),
            Analyzer::Pro(pro) => pro.process(samples),
        }
    }

    fn flush(&mut self) -> Vec<NoteSignal> {
        match self {
            Analyzer::Lite(lite) => lite.flush(),
            Analyzer::Pro(pro) => pro.flush(),
        }
    }
}

/// Keeps confirmed notes and stamps their offsets from the releases.
#[derive(Default)]
struct Collector {
    events: Vec<NoteEvent>,
    open: HashMap<u64, usize>,
}

impl Collector {
    fn extend(&mut self, signals: Vec<NoteSignal>) {
        for signal in signals {
            match signal {
                NoteSignal::Confirmed(event) => {
                    self.open.insert(event.id, self.events.len());
                    self.events.push(event);
                }
                NoteSignal::Released { id, offset_ms, .. } => {
                    if let Some(index) = self.open.remove(&id) {
                        let closed = NoteEvent {
                            offset_ms: Some(offset_ms),
                            ..self.events[index].clone()
                        };
                        self.events[index] = closed;
                    }
                }
                NoteSignal::Tentative(_) | NoteSignal::Cancelled { .. } => {}
            }
        }
    }

    fn finish(mut self) -> Vec<NoteEvent> {
        self.events.sort_by(|a, b| a.onset_ms.total_cmp(&b.onset_ms));
        self.events
    }
}

/// How well a detected transcription agrees with a reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParityReport {
    pub reference: usize,
    pub detected: usize,
    pub matched: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean |onset difference| over matched pairs, ms.
    pub mean_onset_error_ms: f64,
}

/// Pairs notes of equal pitch whose onsets lie within `tolerance_ms`,
/// closest pairs first, each note used at most once.
pub fn compare_transcriptions(
    reference: &[NoteEvent],
    detected: &[NoteEvent],
    tolerance_ms: f64,
) -> ParityReport {
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (r, expected) in reference.iter().enumerate() {
        for (d, found) in detected.iter().enumerate() {
            let error = (found.onset_ms - expected.onset_ms).abs();
            if found.pitch == expected.pitch && error <= tolerance_ms {
                candidates.push((error, r, d));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut used_reference = vec![false; reference.len()];
    let mut used_detected = vec![false; detected.len()];
    let mut matched = 0usize;
    let mut total_error = 0.0;
    for (error, r, d) in candidates {
        if used_reference[r] || used_detected[d] {
            continue;
        }
        used_reference[r] = true;
        used_detected[d] = true;
        matched += 1;
        total_error += error;
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let precision = ratio(matched, detected.len());
    let recall = ratio(matched, reference.len());
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ParityReport {
        reference: reference.len(),
        detected: detected.len(),
        matched,
        precision,
        recall,
        f1,
        mean_onset_error_ms: if matched == 0 { 0.0 } else { total_error / matched as f64 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, NoteSource};
    use crate::tuning::Pitch;

    fn note(pitch: u8, onset_ms: f64) -> NoteEvent {
        NoteEvent {
            id: 0,
            pitch: Pitch::new(pitch).unwrap(),
            onset_ms,
            offset_ms: None,
            velocity: None,
            confidence: 1.0,
            onset_strength: None,
            source: NoteSource::Polyphonic,
            kind: EventKind::Confirmed,
        }
    }

    #[test]
    fn perfect_agreement() {
        let reference = vec![note(60, 0.0), note(62, 500.0), note(64, 1000.0)];
        let report = compare_transcriptions(&reference, &reference, 50.0);
        assert_eq!(report.matched, 3);
        assert_eq!(report.f1, 1.0);
        assert_eq!(report.mean_onset_error_ms, 0.0);
    }

    #[test]
    fn each_note_matches_once() {
        let reference = vec![note(60, 0.0), note(62, 500.0)];
        // two detections near the first reference note, one wrong pitch
        let detected = vec![note(60, 10.0), note(60, 30.0), note(63, 500.0)];
        let report = compare_transcriptions(&reference, &detected, 50.0);
        assert_eq!(report.matched, 1);
        assert!((report.precision - 1.0 / 3.0).abs() < 1e-9);
        assert!((report.recall - 0.5).abs() < 1e-9);
        assert_eq!(report.mean_onset_error_ms, 10.0);
    }

    #[test]
    fn empty_inputs_do_not_divide_by_zero() {
        let report = compare_transcriptions(&[], &[], 50.0);
        assert_eq!(report.f1, 0.0);
        assert_eq!(report.precision, 0.0);
    }

    #[test]
    fn silence_yields_no_notes() {
        let events = analyze_track(
            vec![0.0f32; 44_100],
            44_100,
            &EngineConfig::default(),
            OfflineMode::Monophonic,
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(events.is_empty());
    }
}
