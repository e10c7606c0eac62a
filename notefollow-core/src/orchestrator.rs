//! # Detector Orchestrator Module
//!
//! Runs the whole live pipeline on its own threads:
//!
//! ```text
//! audio source ──► lite worker ──────────────► merge consumer ──► events()
//!                       │                          ▲
//!                       └──► pro worker ◄─► Pro ───┘
//! ```
//!
//! - The **lite worker** owns the [`LitePipeline`] and forwards raw frames to
//!   the pro worker while the exercise is polyphonic.
//! - The **pro worker** owns the [`ProSession`], rebases replies onto the
//!   exercise clock and reconnects on a fixed backoff after failures.
//! - The **merge consumer** owns the [`Timeline`] and both followers. It is
//!   the only place that decides which events are authoritative, so nothing
//!   on the append path needs a lock.
//!
//! All times are ms since the first captured sample (the exercise epoch).

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::AudioSource;
use crate::config::{EngineConfig, GateThresholds};
use crate::error::{FollowError, Result};
use crate::events::{EventKind, IdAllocator, MatchResult, NoteEvent, NoteSignal, NoteSource};
use crate::follower::{FollowerOutput, FollowerState, ScoreFollower};
use crate::lite::LitePipeline;
use crate::remote::{ProReply, ProSession, ProTransport, StreamRebaser};
use crate::score::{Exercise, ExpectedNote};
use crate::timing::TimingFollower;
use crate::tuning::Pitch;
use crate::window::samples_to_ms;

/// Pro worker wake-up interval while idle.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Which detectors an exercise needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    LiteOnly,
    LiteAndPro,
}

/// Monophonic exercises use Lite alone; polyphonic ones add Pro.
pub fn route(exercise: &Exercise) -> Routing {
    if exercise.requires_polyphony {
        Routing::LiteAndPro
    } else {
        Routing::LiteOnly
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Running { routing: Routing },
    /// Pro is unavailable; Lite confirmations are scored instead.
    Degraded { reason: String },
    /// Pro is back and authoritative again.
    Recovered,
    Stopped,
}

/// Which follower produces the match stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Order only, through the score follower.
    #[default]
    Sequence,
    /// Against target times, through the timing follower.
    Timed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Capacity of the audio and pro frame queues.
    pub frame_queue: usize,
    /// Capacity of the queue into the merge consumer.
    pub merge_queue: usize,
    pub reconnect_backoff_ms: u64,
    /// How long a closing Pro session may keep answering.
    pub drain_timeout_ms: u64,
    /// Missed-note marking trails the clock by this much, leaving room for
    /// confirmations still in flight.
    pub missed_holdback_ms: f64,
    pub scoring: ScoringMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            frame_queue: 64,
            merge_queue: 256,
            reconnect_backoff_ms: 1000,
            drain_timeout_ms: 500,
            missed_holdback_ms: 250.0,
            scoring: ScoringMode::Sequence,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_queue == 0 || self.merge_queue == 0 {
            return Err(FollowError::config("orchestrator.queues", "capacities must be > 0"));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(FollowError::config("orchestrator.reconnect_backoff_ms", "must be > 0"));
        }
        if !(self.missed_holdback_ms.is_finite() && self.missed_holdback_ms >= 0.0) {
            return Err(FollowError::config("orchestrator.missed_holdback_ms", "must be >= 0"));
        }
        Ok(())
    }
}

/// Everything a caller can observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Instant feedback, not scored.
    Tentative(NoteEvent),
    /// Authoritative note, fed to the followers.
    Confirmed(NoteEvent),
    Cancelled { id: u64, pitch: Pitch },
    Released { id: u64, pitch: Pitch, offset_ms: f64 },
    Match(MatchResult),
    /// A timed note whose window passed unplayed.
    Missed(ExpectedNote),
    Follower(FollowerState),
    Finished,
    Status(PipelineStatus),
}

pub type StatusCallback = Box<dyn Fn(&PipelineStatus) + Send + Sync>;

/// Confirmed notes ordered by onset on the exercise clock, whatever order
/// they arrived in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    events: Vec<NoteEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event: NoteEvent) {
        let at = self.events.partition_point(|e| e.onset_ms <= event.onset_ms);
        self.events.insert(at, event);
    }

    /// Records the end of note `id` as a new value in its slot.
    pub fn close(&mut self, id: u64, offset_ms: f64) -> bool {
        match self.events.iter_mut().rev().find(|e| e.id == id) {
            Some(slot) => {
                *slot = NoteEvent {
                    offset_ms: Some(offset_ms),
                    ..slot.clone()
                };
                true
            }
            None => false,
        }
    }

    pub fn events(&self) -> &[NoteEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pitches(&self) -> Vec<Pitch> {
        self.events.iter().map(|e| e.pitch).collect()
    }
}

/// Raw audio handed from the lite worker to the pro worker.
#[derive(Debug)]
struct ProFrame {
    start_ms: f64,
    samples: Vec<f32>,
}

#[derive(Debug)]
enum MergeMessage {
    Lite { signals: Vec<NoteSignal>, clock_ms: f64 },
    Pro(Vec<NoteSignal>),
    ProUp,
    ProDown(String),
}

#[derive(Debug)]
enum Control {
    SetExercise(Arc<Exercise>),
    Midi { pitch: Pitch, velocity: u8, at_ms: Option<f64> },
}

#[derive(Debug)]
enum LiteControl {
    Thresholds(GateThresholds),
}

/// Collects the pieces and starts the pipeline.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    exercise: Option<Arc<Exercise>>,
    source: Option<Box<dyn AudioSource>>,
    transport: Option<Box<dyn ProTransport>>,
    on_status: Option<StatusCallback>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            exercise: None,
            source: None,
            transport: None,
            on_status: None,
        }
    }

    pub fn exercise(mut self, exercise: impl Into<Arc<Exercise>>) -> Self {
        self.exercise = Some(exercise.into());
        self
    }

    pub fn source(mut self, source: Box<dyn AudioSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Without a transport, polyphonic exercises run degraded from the start.
    pub fn transport(mut self, transport: Box<dyn ProTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Called on the consumer thread for every status change.
    pub fn on_status(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    pub fn start(self) -> Result<DetectorOrchestrator> {
        let OrchestratorBuilder {
            config,
            exercise,
            source,
            transport,
            on_status,
        } = self;
        config.validate()?;
        let exercise = exercise.ok_or_else(|| FollowError::config("exercise", "no exercise set"))?;
        let mut source = source.ok_or_else(|| FollowError::config("source", "no audio source set"))?;

        let sample_rate = source.sample_rate();
        let ids = IdAllocator::new();
        let lite = LitePipeline::new(&config.lite, sample_rate, ids.clone())?;
        let follower = ScoreFollower::new(Arc::clone(&exercise.score), config.follower.clone())?;
        let timing = TimingFollower::new(Arc::clone(&exercise.score), config.timing.clone())?;

        let routing = route(&exercise);
        let pro_available = transport.is_some();
        let poly_active = Arc::new(AtomicBool::new(routing == Routing::LiteAndPro && pro_available));
        let orchestration = &config.orchestrator;

        let (audio_tx, audio_rx) = bounded(orchestration.frame_queue);
        let (frame_tx, frame_rx) = bounded(orchestration.frame_queue);
        let (merge_tx, merge_rx) = bounded(orchestration.merge_queue);
        let (event_tx, event_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (lite_control_tx, lite_control_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let consumer = Consumer {
            config: config.orchestrator.clone(),
            ids: ids.clone(),
            routing,
            pro_available,
            pro_healthy: true,
            poly_active: Arc::clone(&poly_active),
            timeline: Timeline::new(),
            follower,
            timing,
            scored_lite: HashSet::new(),
            clock_ms: 0.0,
            finished: false,
            events: event_tx,
            on_status,
        };
        let consumer = thread::Builder::new()
            .name("orchestrator-merge".into())
            .spawn(move || consumer.run(merge_rx, control_rx))?;

        let lite_worker = {
            let merge_tx = merge_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let poly_active = Arc::clone(&poly_active);
            thread::Builder::new().name("orchestrator-lite".into()).spawn(move || {
                run_lite(lite, audio_rx, frame_tx, merge_tx, lite_control_rx, shutdown_rx, poly_active)
            })?
        };

        let pro_worker = match transport {
            Some(transport) => {
                let worker = ProWorker {
                    transport,
                    sample_rate,
                    ids,
                    backoff: Duration::from_millis(orchestration.reconnect_backoff_ms),
                    drain_timeout: Duration::from_millis(orchestration.drain_timeout_ms),
                    poly_active: Arc::clone(&poly_active),
                    merge: merge_tx,
                };
                Some(
                    thread::Builder::new()
                        .name("orchestrator-pro".into())
                        .spawn(move || worker.run(frame_rx, shutdown_rx))?,
                )
            }
            None => {
                drop(merge_tx);
                None
            }
        };

        let mut orchestrator = DetectorOrchestrator {
            exercise: RwLock::new(exercise),
            source: None,
            control: Some(control_tx),
            lite_control: Some(lite_control_tx),
            shutdown: Some(shutdown_tx),
            events: event_rx,
            lite_worker: Some(lite_worker),
            pro_worker,
            consumer: Some(consumer),
        };

        if let Err(e) = source.start(audio_tx) {
            log::error!("[ORCH] audio source failed to start: {e}");
            orchestrator.stop();
            return Err(e);
        }
        orchestrator.source = Some(source);
        log::info!("[ORCH] started: {routing:?} at {sample_rate} Hz");
        Ok(orchestrator)
    }
}

/// Handle to a running pipeline. Dropping it stops everything.
pub struct DetectorOrchestrator {
    exercise: RwLock<Arc<Exercise>>,
    source: Option<Box<dyn AudioSource>>,
    control: Option<Sender<Control>>,
    lite_control: Option<Sender<LiteControl>>,
    shutdown: Option<Sender<()>>,
    events: Receiver<OrchestratorEvent>,
    lite_worker: Option<JoinHandle<()>>,
    pro_worker: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<Timeline>>,
}

impl DetectorOrchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// The event stream. Closes once the pipeline has fully stopped.
    pub fn events(&self) -> &Receiver<OrchestratorEvent> {
        &self.events
    }

    pub fn exercise(&self) -> Arc<Exercise> {
        match self.exercise.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the exercise as a whole; the followers restart on it.
    pub fn set_exercise(&self, exercise: impl Into<Arc<Exercise>>) -> Result<()> {
        let exercise = exercise.into();
        match self.exercise.write() {
            Ok(mut guard) => *guard = Arc::clone(&exercise),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&exercise),
        }
        self.send_control(Control::SetExercise(exercise))
    }

    /// Injects a key press from a MIDI device at the current clock.
    pub fn submit_midi(&self, pitch: Pitch, velocity: u8) -> Result<()> {
        self.send_control(Control::Midi {
            pitch,
            velocity,
            at_ms: None,
        })
    }

    /// Injects a key press with an explicit exercise-clock timestamp.
    pub fn submit_midi_at(&self, pitch: Pitch, velocity: u8, at_ms: f64) -> Result<()> {
        self.send_control(Control::Midi {
            pitch,
            velocity,
            at_ms: Some(at_ms),
        })
    }

    /// Pushes new gate thresholds into the running Lite path.
    pub fn set_thresholds(&self, thresholds: GateThresholds) -> Result<()> {
        thresholds.validate()?;
        self.lite_control
            .as_ref()
            .ok_or(FollowError::ChannelClosed)?
            .send(LiteControl::Thresholds(thresholds))
            .map_err(|_| FollowError::ChannelClosed)
    }

    fn send_control(&self, message: Control) -> Result<()> {
        self.control
            .as_ref()
            .ok_or(FollowError::ChannelClosed)?
            .send(message)
            .map_err(|_| FollowError::ChannelClosed)
    }

    /// True once every worker has exited on its own (the source ran dry).
    pub fn is_finished(&self) -> bool {
        self.consumer.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stops the source, closes the Pro session and joins every thread.
    /// After it returns no status callback runs again. Returns the timeline
    /// on the first call, `None` afterwards.
    pub fn stop(&mut self) -> Option<Timeline> {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        self.source = None;
        self.shutdown = None;

        join("lite", self.lite_worker.take());
        join("pro", self.pro_worker.take());

        self.control = None;
        self.lite_control = None;
        let timeline = self.consumer.take().and_then(|h| match h.join() {
            Ok(timeline) => Some(timeline),
            Err(_) => {
                log::error!("[ORCH] merge consumer panicked");
                None
            }
        });
        if timeline.is_some() {
            log::info!("[ORCH] stopped");
        }
        timeline
    }
}

impl Drop for DetectorOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::error!("[ORCH] {name} worker panicked");
        }
    }
}

fn run_lite(
    mut lite: LitePipeline,
    audio: Receiver<Vec<f32>>,
    frames: Sender<ProFrame>,
    merge: Sender<MergeMessage>,
    control: Receiver<LiteControl>,
    shutdown: Receiver<()>,
    poly_active: Arc<AtomicBool>,
) {
    let closed = never();
    let mut control_open = true;
    let mut dropped = 0u64;

    loop {
        let control_rx = if control_open { &control } else { &closed };
        select! {
            recv(audio) -> msg => {
                let Ok(samples) = msg else { break };
                if poly_active.load(Ordering::Relaxed) {
                    let frame = ProFrame { start_ms: lite.clock_ms(), samples: samples.clone() };
                    if let Err(TrySendError::Full(_)) = frames.try_send(frame) {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            log::warn!("[LITE] pro queue full, {dropped} frames dropped");
                        }
                    }
                }
                let signals = lite.process(&samples);
                let clock_ms = lite.clock_ms();
                if merge.send(MergeMessage::Lite { signals, clock_ms }).is_err() {
                    break;
                }
            }
            recv(control_rx) -> msg => match msg {
                Ok(LiteControl::Thresholds(t)) => match lite.apply_thresholds(&t) {
                    Ok(()) => log::info!("[LITE] thresholds updated: {t:?}"),
                    Err(e) => log::warn!("[LITE] rejected thresholds: {e}"),
                },
                Err(_) => control_open = false,
            },
            recv(shutdown) -> _ => break,
        }
    }

    let signals = lite.flush();
    let clock_ms = lite.clock_ms();
    let _ = merge.send(MergeMessage::Lite { signals, clock_ms });
    log::debug!("[LITE] worker exiting at {clock_ms:.0} ms");
}

struct ProLink {
    session: ProSession,
    rebaser: StreamRebaser,
    /// Exercise time of the next sample the server expects.
    next_ms: f64,
    seq: u64,
}

struct ProWorker {
    transport: Box<dyn ProTransport>,
    sample_rate: u32,
    ids: IdAllocator,
    backoff: Duration,
    drain_timeout: Duration,
    poly_active: Arc<AtomicBool>,
    merge: Sender<MergeMessage>,
}

impl ProWorker {
    fn run(mut self, frames: Receiver<ProFrame>, shutdown: Receiver<()>) {
        let mut link: Option<ProLink> = None;
        let mut retry_at: Option<Instant> = None;

        loop {
            let replies = link
                .as_ref()
                .map(|l| l.session.replies().clone())
                .unwrap_or_else(never);
            select! {
                recv(frames) -> msg => {
                    let Ok(frame) = msg else {
                        if let Some(link) = link.take() {
                            self.drain(link);
                        }
                        break;
                    };
                    if link.is_none() && retry_at.is_none_or(|t| Instant::now() >= t) {
                        match self.transport.connect(self.sample_rate) {
                            Ok(session) => {
                                log::info!("[PRO] connected, stream offset {:.1} ms", frame.start_ms);
                                link = Some(ProLink {
                                    session,
                                    rebaser: StreamRebaser::new(frame.start_ms, self.ids.clone()),
                                    next_ms: frame.start_ms,
                                    seq: 0,
                                });
                                retry_at = None;
                                let _ = self.merge.send(MergeMessage::ProUp);
                            }
                            Err(e) => {
                                retry_at = Some(Instant::now() + self.backoff);
                                self.report_down(format!("connect failed: {e}"));
                            }
                        }
                    }
                    if let Some(active) = link.as_mut() {
                        if let Err(e) = self.forward(active, frame) {
                            link = None;
                            retry_at = Some(Instant::now() + self.backoff);
                            self.report_down(e.to_string());
                        }
                    }
                }
                recv(replies) -> msg => match msg {
                    Ok(ProReply::Notes { signals, .. }) => {
                        if let Some(active) = link.as_mut() {
                            let signals = signals.into_iter().map(|s| active.rebaser.apply(s)).collect();
                            let _ = self.merge.send(MergeMessage::Pro(signals));
                        }
                    }
                    Ok(ProReply::Error(reason)) => {
                        link = None;
                        retry_at = Some(Instant::now() + self.backoff);
                        self.report_down(reason);
                    }
                    Err(_) => {
                        link = None;
                        retry_at = Some(Instant::now() + self.backoff);
                        self.report_down("session closed by server".into());
                    }
                },
                recv(shutdown) -> _ => break,
                default(IDLE_POLL) => {
                    if link.is_some() && !self.poly_active.load(Ordering::Relaxed) {
                        log::info!("[PRO] exercise no longer polyphonic, closing session");
                        link = None;
                    }
                }
            }
        }
        log::debug!("[PRO] worker exiting");
    }

    /// Sends a frame, padding with silence over any frames the lite worker
    /// dropped so the server clock stays aligned with the exercise clock.
    fn forward(&self, link: &mut ProLink, frame: ProFrame) -> Result<()> {
        let gap_ms = frame.start_ms - link.next_ms;
        let gap = (gap_ms * self.sample_rate as f64 / 1000.0).round();
        if gap >= 1.0 {
            link.seq += 1;
            link.session.send_audio(link.seq, vec![0.0; gap as usize])?;
        }
        link.next_ms = frame.start_ms + samples_to_ms(frame.samples.len() as u64, self.sample_rate);
        link.seq += 1;
        link.session.send_audio(link.seq, frame.samples)
    }

    /// Closes the session and forwards what it still has to say.
    fn drain(&self, mut link: ProLink) {
        link.session.close();
        let deadline = Instant::now() + self.drain_timeout;
        let replies = link.session.replies().clone();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match replies.recv_timeout(left) {
                Ok(ProReply::Notes { signals, .. }) => {
                    let signals = signals.into_iter().map(|s| link.rebaser.apply(s)).collect();
                    let _ = self.merge.send(MergeMessage::Pro(signals));
                }
                Ok(ProReply::Error(_)) | Err(_) => break,
            }
        }
    }

    fn report_down(&self, reason: String) {
        log::warn!("[PRO] {reason}");
        let _ = self.merge.send(MergeMessage::ProDown(reason));
    }
}

struct Consumer {
    config: OrchestratorConfig,
    ids: IdAllocator,
    routing: Routing,
    pro_available: bool,
    /// Optimistic until the pro worker reports a failure.
    pro_healthy: bool,
    poly_active: Arc<AtomicBool>,
    timeline: Timeline,
    follower: ScoreFollower,
    timing: TimingFollower,
    /// Lite notes that were scored and so must end as releases.
    scored_lite: HashSet<u64>,
    clock_ms: f64,
    finished: bool,
    events: Sender<OrchestratorEvent>,
    on_status: Option<StatusCallback>,
}

impl Consumer {
    fn run(mut self, merge: Receiver<MergeMessage>, control: Receiver<Control>) -> Timeline {
        self.set_status(PipelineStatus::Running {
            routing: self.routing,
        });
        if self.routing == Routing::LiteAndPro && !self.pro_available {
            self.pro_healthy = false;
            self.set_status(PipelineStatus::Degraded {
                reason: "no pro transport configured".into(),
            });
        }
        self.emit(OrchestratorEvent::Follower(self.follower.state()));

        let closed = never();
        let mut control_open = true;
        loop {
            let control_rx = if control_open { &control } else { &closed };
            select! {
                recv(merge) -> msg => match msg {
                    Ok(message) => self.on_message(message),
                    Err(_) => break,
                },
                recv(control_rx) -> msg => match msg {
                    Ok(command) => self.on_control(command),
                    Err(_) => control_open = false,
                },
            }
        }

        self.set_status(PipelineStatus::Stopped);
        self.timeline
    }

    /// Lite confirmations are dropped while Pro is authoritative.
    fn lite_demoted(&self) -> bool {
        self.routing == Routing::LiteAndPro && self.pro_healthy
    }

    fn on_message(&mut self, message: MergeMessage) {
        match message {
            MergeMessage::Lite { signals, clock_ms } => {
                for signal in signals {
                    self.on_lite(signal);
                }
                self.clock_ms = self.clock_ms.max(clock_ms);
                self.advance_timing();
            }
            MergeMessage::Pro(signals) => {
                for signal in signals {
                    self.on_pro(signal);
                }
            }
            MergeMessage::ProUp => {
                if !self.pro_healthy {
                    self.pro_healthy = true;
                    self.set_status(PipelineStatus::Recovered);
                }
            }
            MergeMessage::ProDown(reason) => {
                if self.pro_healthy && self.routing == Routing::LiteAndPro {
                    self.pro_healthy = false;
                    self.set_status(PipelineStatus::Degraded { reason });
                }
            }
        }
    }

    fn on_lite(&mut self, signal: NoteSignal) {
        match signal {
            NoteSignal::Tentative(event) => self.emit(OrchestratorEvent::Tentative(event)),
            NoteSignal::Confirmed(event) => {
                if self.lite_demoted() {
                    log::trace!("[ORCH] lite {} demoted", event.pitch);
                    return;
                }
                self.scored_lite.insert(event.id);
                self.accept(event);
            }
            NoteSignal::Cancelled { id, pitch } => {
                self.emit(OrchestratorEvent::Cancelled { id, pitch })
            }
            NoteSignal::Released { id, pitch, offset_ms } => {
                if self.scored_lite.remove(&id) {
                    self.timeline.close(id, offset_ms);
                    self.emit(OrchestratorEvent::Released { id, pitch, offset_ms });
                } else {
                    // Its confirmation was demoted; the tentative just ends.
                    self.emit(OrchestratorEvent::Cancelled { id, pitch });
                }
            }
        }
    }

    /// Pro output counts only while Pro is authoritative. Once degraded,
    /// Lite is scoring and a draining session's replies are dropped.
    fn on_pro(&mut self, signal: NoteSignal) {
        let authoritative = self.lite_demoted();
        match signal {
            NoteSignal::Released { id, pitch, offset_ms } => {
                // Notes accepted while Pro was healthy still get their end.
                if self.timeline.close(id, offset_ms) {
                    self.emit(OrchestratorEvent::Released { id, pitch, offset_ms });
                }
            }
            _ if !authoritative => {
                log::trace!("[ORCH] pro {} dropped, lite is scoring", signal.pitch());
            }
            NoteSignal::Confirmed(event) => self.accept(event),
            NoteSignal::Tentative(event) => self.emit(OrchestratorEvent::Tentative(event)),
            NoteSignal::Cancelled { id, pitch } => {
                self.emit(OrchestratorEvent::Cancelled { id, pitch })
            }
        }
    }

    fn on_control(&mut self, command: Control) {
        match command {
            Control::SetExercise(exercise) => {
                let routing = route(&exercise);
                log::info!("[ORCH] exercise '{}' ({routing:?})", exercise.name);
                self.follower.set_score(Arc::clone(&exercise.score));
                self.timing.set_score(Arc::clone(&exercise.score));
                self.finished = false;
                self.poly_active
                    .store(routing == Routing::LiteAndPro && self.pro_available, Ordering::Relaxed);
                if routing != self.routing {
                    self.routing = routing;
                    self.pro_healthy = self.pro_available;
                    self.set_status(PipelineStatus::Running { routing });
                    if routing == Routing::LiteAndPro && !self.pro_available {
                        self.set_status(PipelineStatus::Degraded {
                            reason: "no pro transport configured".into(),
                        });
                    }
                }
                self.emit(OrchestratorEvent::Follower(self.follower.state()));
            }
            Control::Midi {
                pitch,
                velocity,
                at_ms,
            } => {
                let event = NoteEvent {
                    id: self.ids.next_id(),
                    pitch,
                    onset_ms: at_ms.unwrap_or(self.clock_ms),
                    offset_ms: None,
                    velocity: Some(velocity),
                    confidence: 1.0,
                    onset_strength: None,
                    source: NoteSource::Midi,
                    kind: EventKind::Confirmed,
                };
                self.accept(event);
            }
        }
    }

    /// Records an authoritative note and scores it.
    fn accept(&mut self, event: NoteEvent) {
        self.timeline.insert(event.clone());
        self.emit(OrchestratorEvent::Confirmed(event.clone()));

        let sequence = self.config.scoring == ScoringMode::Sequence;
        for output in self.follower.process(event.pitch, event.onset_ms) {
            match output {
                FollowerOutput::Match(result) if sequence => self.emit(OrchestratorEvent::Match(result)),
                FollowerOutput::State(state) => self.emit(OrchestratorEvent::Follower(state)),
                FollowerOutput::Finished if sequence => self.finish(),
                _ => {}
            }
        }

        if !sequence {
            if let Some(result) = self.timing.process(event.pitch, event.onset_ms) {
                self.emit(OrchestratorEvent::Match(result));
            }
            if self.timing.is_complete() {
                self.finish();
            }
        }
    }

    fn advance_timing(&mut self) {
        if self.config.scoring != ScoringMode::Timed {
            return;
        }
        let horizon = self.clock_ms - self.config.missed_holdback_ms;
        for note in self.timing.advance(horizon) {
            log::debug!("[FOLLOW] missed {} at {:.0} ms", note.pitch, note.expected_time_ms);
            self.emit(OrchestratorEvent::Missed(note));
        }
        if self.timing.is_complete() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(OrchestratorEvent::Finished);
        }
    }

    fn set_status(&mut self, status: PipelineStatus) {
        log::info!("[ORCH] status {status:?}");
        if let Some(callback) = &self.on_status {
            callback(&status);
        }
        self.emit(OrchestratorEvent::Status(status));
    }

    fn emit(&self, event: OrchestratorEvent) {
        // Nobody listening is fine; the timeline still records everything.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::Score;

    fn event(id: u64, pitch: u8, onset_ms: f64) -> NoteEvent {
        NoteEvent {
            id,
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
    fn routing_follows_exercise_metadata() {
        let mono = Exercise::new("scale", "C4 D4 E4".parse::<Score>().unwrap());
        let chords = Exercise::new("chords", "C4+E4+G4".parse::<Score>().unwrap());
        assert_eq!(route(&mono), Routing::LiteOnly);
        assert_eq!(route(&chords), Routing::LiteAndPro);
        assert_eq!(route(&mono.clone().with_polyphony(true)), Routing::LiteAndPro);
    }

    #[test]
    fn timeline_orders_by_onset_not_arrival() {
        let mut timeline = Timeline::new();
        timeline.insert(event(1, 60, 100.0));
        timeline.insert(event(2, 64, 300.0));
        // a late pro confirmation for an earlier note
        timeline.insert(event(3, 67, 200.0));
        assert_eq!(
            timeline.pitches(),
            vec![Pitch::new(60).unwrap(), Pitch::new(67).unwrap(), Pitch::new(64).unwrap()]
        );

        assert!(timeline.close(3, 450.0));
        assert_eq!(timeline.events()[1].offset_ms, Some(450.0));
        assert!(!timeline.close(99, 1.0));
    }

    fn consumer(exercise: &Exercise, events: Sender<OrchestratorEvent>) -> Consumer {
        let routing = route(exercise);
        Consumer {
            config: OrchestratorConfig::default(),
            ids: IdAllocator::new(),
            routing,
            pro_available: true,
            pro_healthy: true,
            poly_active: Arc::new(AtomicBool::new(routing == Routing::LiteAndPro)),
            timeline: Timeline::new(),
            follower: ScoreFollower::new(Arc::clone(&exercise.score), Default::default()).unwrap(),
            timing: TimingFollower::new(Arc::clone(&exercise.score), Default::default()).unwrap(),
            scored_lite: HashSet::new(),
            clock_ms: 0.0,
            finished: false,
            events,
            on_status: None,
        }
    }

    fn confirmed_sources(events: &Receiver<OrchestratorEvent>) -> Vec<NoteSource> {
        events
            .try_iter()
            .filter_map(|e| match e {
                OrchestratorEvent::Confirmed(n) => Some(n.source),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pro_replies_after_degradation_are_not_scored() {
        let exercise = Exercise::new("chords", "C4+E4+G4 C4".parse::<Score>().unwrap());
        let (tx, rx) = unbounded();
        let mut consumer = consumer(&exercise, tx);

        consumer.on_message(MergeMessage::Pro(vec![NoteSignal::Confirmed(event(1, 60, 100.0))]));
        assert_eq!(confirmed_sources(&rx), vec![NoteSource::Polyphonic]);

        consumer.on_message(MergeMessage::ProDown("session closed".into()));
        // A draining session still answers: its new notes are dropped, the
        // note already scored is closed.
        consumer.on_message(MergeMessage::Pro(vec![
            NoteSignal::Confirmed(event(2, 64, 110.0)),
            NoteSignal::Released {
                id: 1,
                pitch: Pitch::new(60).unwrap(),
                offset_ms: 400.0,
            },
        ]));
        let mut lite = event(3, 64, 115.0);
        lite.source = NoteSource::Monophonic;
        consumer.on_message(MergeMessage::Lite {
            signals: vec![NoteSignal::Confirmed(lite)],
            clock_ms: 500.0,
        });

        assert_eq!(confirmed_sources(&rx), vec![NoteSource::Monophonic]);
        assert_eq!(consumer.timeline.len(), 2);
        assert_eq!(consumer.timeline.events()[0].offset_ms, Some(400.0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = OrchestratorConfig {
            reconnect_backoff_ms: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(OrchestratorConfig::default().validate().is_ok());
    }
}
