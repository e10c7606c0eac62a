//! # Pro Transport Module
//!
//! The boundary between the local Lite path and the authoritative polyphonic
//! Pro path. Raw audio goes out as numbered frames; confirmed polyphonic
//! signals come back stamped on the server's own clock, which starts at the
//! first sample the session received.
//!
//! ## Features
//! - `ProTransport` trait so the orchestrator never knows where Pro runs
//! - `ProSession`: a pair of channels plus an optional local worker, closed
//!   and joined on drop
//! - `LocalProServer`: in-process server thread running [`ProPipeline`],
//!   with fault injection for refused connects and dropped sessions
//! - `StreamRebaser`: moves server signals onto the exercise clock and
//!   re-keys their ids into the local id space

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use crate::error::{FollowError, Result};
use crate::events::{IdAllocator, NoteSignal};
use crate::poly::{ChordTracker, PolyConfig, PolyphonicDetector, TrackerConfig, POLY_WINDOW};
use crate::window::{samples_to_ms, WindowBuffer};

/// Client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ProRequest {
    Audio { seq: u64, samples: Vec<f32> },
    Close,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProReply {
    /// Signals produced while handling frame `seq`, server-relative times.
    Notes { seq: u64, signals: Vec<NoteSignal> },
    /// The session failed; no further replies follow.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProConfig {
    pub window_size: usize,
    pub hop_size: usize,
    pub poly: PolyConfig,
    pub tracker: TrackerConfig,
    /// Frames in flight before the client blocks.
    pub queue_capacity: usize,
}

impl Default for ProConfig {
    fn default() -> Self {
        Self {
            window_size: POLY_WINDOW,
            hop_size: POLY_WINDOW / 2,
            poly: PolyConfig::default(),
            tracker: TrackerConfig::default(),
            queue_capacity: 32,
        }
    }
}

impl ProConfig {
    pub fn validate(&self) -> Result<()> {
        WindowBuffer::new(self.window_size, self.hop_size, 44_100)?;
        self.poly.validate()?;
        self.tracker.validate()?;
        if self.queue_capacity == 0 {
            return Err(FollowError::config("pro.queue_capacity", "must be > 0"));
        }
        Ok(())
    }
}

/// Polyphonic detection from raw samples to authoritative signals.
#[derive(Debug)]
pub struct ProPipeline {
    buffer: WindowBuffer,
    detector: PolyphonicDetector,
    tracker: ChordTracker,
}

impl ProPipeline {
    pub fn new(config: &ProConfig, sample_rate: u32, ids: IdAllocator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buffer: WindowBuffer::new(config.window_size, config.hop_size, sample_rate)?,
            detector: PolyphonicDetector::new(config.poly.clone())?,
            tracker: ChordTracker::new(config.tracker.clone(), ids)?,
        })
    }

    /// Server clock: ms of audio received so far.
    pub fn clock_ms(&self) -> f64 {
        samples_to_ms(self.buffer.samples_seen(), self.buffer.sample_rate())
    }

    /// Feeds samples; returns only confirmed and released signals.
    pub fn process(&mut self, samples: &[f32]) -> Vec<NoteSignal> {
        let sample_rate = self.buffer.sample_rate();
        let mut out = Vec::new();
        for window in self.buffer.push(samples) {
            let time_ms = (window.start_ms() + window.end_ms()) / 2.0;
            let notes = self.detector.detect(window.samples(), sample_rate);
            log::trace!("[PRO] {time_ms:.1} ms {} notes", notes.len());
            out.extend(
                self.tracker
                    .update(time_ms, &notes)
                    .into_iter()
                    .filter(is_authoritative),
            );
        }
        out
    }

    /// Releases every sounding note at the current clock.
    pub fn flush(&mut self) -> Vec<NoteSignal> {
        let now = self.clock_ms();
        self.tracker
            .flush(now)
            .into_iter()
            .filter(is_authoritative)
            .collect()
    }
}

/// Tentative tiers stay on the server; the client only sees final answers.
fn is_authoritative(signal: &NoteSignal) -> bool {
    matches!(signal, NoteSignal::Confirmed(_) | NoteSignal::Released { .. })
}

/// One connected Pro stream.
#[derive(Debug)]
pub struct ProSession {
    requests: Sender<ProRequest>,
    replies: Receiver<ProReply>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl ProSession {
    pub fn new(requests: Sender<ProRequest>, replies: Receiver<ProReply>) -> Self {
        Self {
            requests,
            replies,
            worker: None,
            closed: false,
        }
    }

    /// Attaches the thread serving this session; it is joined on close.
    pub fn with_worker(mut self, worker: JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn send_audio(&self, seq: u64, samples: Vec<f32>) -> Result<()> {
        self.requests
            .send(ProRequest::Audio { seq, samples })
            .map_err(|_| FollowError::Transport("pro session closed".into()))
    }

    pub fn replies(&self) -> &Receiver<ProReply> {
        &self.replies
    }

    /// Asks the server to finish and waits for its worker. Replies produced
    /// while closing stay readable from [`replies`](Self::replies).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.requests.send(ProRequest::Close);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[PRO] server worker panicked");
            }
        }
    }
}

impl Drop for ProSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens Pro sessions.
pub trait ProTransport: Send {
    fn connect(&mut self, sample_rate: u32) -> Result<ProSession>;
}

/// Runs the Pro pipeline on a thread inside this process.
#[derive(Debug, Clone, Default)]
pub struct LocalProServer {
    config: ProConfig,
    refusals_left: u32,
    fail_after: Option<u64>,
    sessions: u64,
}

impl LocalProServer {
    pub fn new(config: ProConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// The next `n` connection attempts fail.
    pub fn refuse_connects(mut self, n: u32) -> Self {
        self.refusals_left = n;
        self
    }

    /// The next session drops with an error after `frames` audio frames.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }
}

impl ProTransport for LocalProServer {
    fn connect(&mut self, sample_rate: u32) -> Result<ProSession> {
        if self.refusals_left > 0 {
            self.refusals_left -= 1;
            return Err(FollowError::Transport("connection refused".into()));
        }

        let pipeline = ProPipeline::new(&self.config, sample_rate, IdAllocator::new())?;
        let (request_tx, request_rx) = bounded(self.config.queue_capacity);
        let (reply_tx, reply_rx) = unbounded();
        let fail_after = self.fail_after.take();
        self.sessions += 1;
        let session_no = self.sessions;

        let worker = thread::Builder::new()
            .name(format!("pro-session-{session_no}"))
            .spawn(move || serve(pipeline, request_rx, reply_tx, fail_after))?;
        log::info!("[PRO] session {session_no} opened at {sample_rate} Hz");
        Ok(ProSession::new(request_tx, reply_rx).with_worker(worker))
    }
}

fn serve(
    mut pipeline: ProPipeline,
    requests: Receiver<ProRequest>,
    replies: Sender<ProReply>,
    fail_after: Option<u64>,
) {
    let mut frames = 0u64;
    let mut last_seq = 0u64;
    for request in requests.iter() {
        match request {
            ProRequest::Audio { seq, samples } => {
                if fail_after.is_some_and(|n| frames >= n) {
                    log::warn!("[PRO] dropping session after {frames} frames");
                    let _ = replies.send(ProReply::Error("connection reset".into()));
                    return;
                }
                frames += 1;
                last_seq = seq;
                let signals = pipeline.process(&samples);
                if !signals.is_empty() && replies.send(ProReply::Notes { seq, signals }).is_err() {
                    return;
                }
            }
            ProRequest::Close => break,
        }
    }

    let signals = pipeline.flush();
    if !signals.is_empty() {
        let _ = replies.send(ProReply::Notes {
            seq: last_seq,
            signals,
        });
    }
    log::debug!("[PRO] session closed after {frames} frames");
}

/// Server time to exercise time.
pub fn rebase(server_ms: f64, stream_offset_ms: f64) -> f64 {
    stream_offset_ms + server_ms
}

/// Rebases one session's signals onto the exercise clock and gives each
/// server id a fresh local id, so Pro events never collide with Lite's.
#[derive(Debug)]
pub struct StreamRebaser {
    offset_ms: f64,
    ids: IdAllocator,
    local_ids: HashMap<u64, u64>,
}

impl StreamRebaser {
    pub fn new(stream_offset_ms: f64, ids: IdAllocator) -> Self {
        Self {
            offset_ms: stream_offset_ms,
            ids,
            local_ids: HashMap::new(),
        }
    }

    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    pub fn apply(&mut self, signal: NoteSignal) -> NoteSignal {
        let server_id = signal.id();
        let local_id = match &signal {
            NoteSignal::Released { .. } | NoteSignal::Cancelled { .. } => self
                .local_ids
                .remove(&server_id)
                .unwrap_or_else(|| self.ids.next_id()),
            NoteSignal::Tentative(_) | NoteSignal::Confirmed(_) => *self
                .local_ids
                .entry(server_id)
                .or_insert_with(|| self.ids.next_id()),
        };

        match signal.shifted(self.offset_ms) {
            NoteSignal::Tentative(mut e) => {
                e.id = local_id;
                NoteSignal::Tentative(e)
            }
            NoteSignal::Confirmed(mut e) => {
                e.id = local_id;
                NoteSignal::Confirmed(e)
            }
            NoteSignal::Cancelled { pitch, .. } => NoteSignal::Cancelled { id: local_id, pitch },
            NoteSignal::Released { pitch, offset_ms, .. } => NoteSignal::Released {
                id: local_id,
                pitch,
                offset_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, NoteEvent, NoteSource};
    use crate::tuning::Pitch;
    use std::f32::consts::PI;
    use std::time::Duration;

    const SR: u32 = 44_100;

    fn triad(ms: usize) -> Vec<f32> {
        let n = SR as usize * ms / 1000;
        (0..n)
            .map(|i| {
                let t = i as f32 / SR as f32;
                [261.63f32, 329.63, 392.0]
                    .iter()
                    .map(|f| 0.2 * (2.0 * PI * f * t).sin())
                    .sum::<f32>()
            })
            .collect()
    }

    fn confirmed_pitches(signals: &[NoteSignal]) -> Vec<Pitch> {
        let mut pitches: Vec<Pitch> = signals
            .iter()
            .filter_map(|s| match s {
                NoteSignal::Confirmed(e) => Some(e.pitch),
                _ => None,
            })
            .collect();
        pitches.sort();
        pitches
    }

    #[test]
    fn pipeline_confirms_a_triad_and_releases_on_flush() {
        let mut pro = ProPipeline::new(&ProConfig::default(), SR, IdAllocator::new()).unwrap();
        let mut signals = pro.process(&triad(500));
        assert!(signals.iter().all(is_authoritative));
        assert_eq!(
            confirmed_pitches(&signals),
            vec![Pitch::new(60).unwrap(), Pitch::new(64).unwrap(), Pitch::new(67).unwrap()]
        );

        signals = pro.flush();
        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|s| matches!(s, NoteSignal::Released { .. })));
    }

    #[test]
    fn local_session_round_trip() {
        let mut server = LocalProServer::new(ProConfig::default()).unwrap();
        let mut session = server.connect(SR).unwrap();
        for (seq, chunk) in triad(500).chunks(2048).enumerate() {
            session.send_audio(seq as u64, chunk.to_vec()).unwrap();
        }
        session.close();

        let signals: Vec<NoteSignal> = session
            .replies()
            .try_iter()
            .flat_map(|reply| match reply {
                ProReply::Notes { signals, .. } => signals,
                ProReply::Error(e) => panic!("unexpected error {e}"),
            })
            .collect();
        assert_eq!(confirmed_pitches(&signals).len(), 3);
        let released = signals
            .iter()
            .filter(|s| matches!(s, NoteSignal::Released { .. }))
            .count();
        assert_eq!(released, 3);
        assert_eq!(server.sessions(), 1);
    }

    #[test]
    fn injected_faults() {
        let mut server = LocalProServer::new(ProConfig::default())
            .unwrap()
            .refuse_connects(1)
            .fail_after(2);
        assert!(matches!(server.connect(SR), Err(FollowError::Transport(_))));

        let session = server.connect(SR).unwrap();
        for seq in 0..3 {
            let _ = session.send_audio(seq, vec![0.0; 512]);
        }
        let reply = session.replies().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply, ProReply::Error("connection reset".into()));

        // Only the first session fails.
        let healthy = server.connect(SR).unwrap();
        for seq in 0..5 {
            healthy.send_audio(seq, vec![0.0; 512]).unwrap();
        }
        drop(healthy);
        assert_eq!(server.sessions(), 2);
    }

    #[test]
    fn rebaser_shifts_times_and_rekeys_ids() {
        let ids = IdAllocator::new();
        ids.next_id();
        let mut rebaser = StreamRebaser::new(2000.0, ids);
        let event = NoteEvent {
            id: 1,
            pitch: Pitch::new(60).unwrap(),
            onset_ms: 46.0,
            offset_ms: None,
            velocity: None,
            confidence: 0.9,
            onset_strength: None,
            source: NoteSource::Polyphonic,
            kind: EventKind::Confirmed,
        };

        let NoteSignal::Confirmed(local) = rebaser.apply(NoteSignal::Confirmed(event)) else {
            panic!("kind changed");
        };
        assert_eq!(local.onset_ms, rebase(46.0, 2000.0));
        assert_eq!(local.id, 2);

        let released = rebaser.apply(NoteSignal::Released {
            id: 1,
            pitch: Pitch::new(60).unwrap(),
            offset_ms: 300.0,
        });
        assert_eq!(
            released,
            NoteSignal::Released {
                id: 2,
                pitch: Pitch::new(60).unwrap(),
                offset_ms: 2300.0
            }
        );
    }
}
