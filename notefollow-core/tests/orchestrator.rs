// End-to-end runs of the orchestrator over replayed audio.

use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notefollow_core::orchestrator::{OrchestratorEvent, PipelineStatus, Routing, ScoringMode};
use notefollow_core::remote::LocalProServer;
use notefollow_core::{
    analyze_track, DetectorOrchestrator, EngineConfig, Exercise, FollowError, GateThresholds, NoteSource, OfflineMode,
    Pitch, ReplaySource, Score,
};

const SR: u32 = 44_100;

fn p(name: &str) -> Pitch {
    name.parse().unwrap()
}

fn silence(ms: usize) -> Vec<f32> {
    vec![0.0; SR as usize * ms / 1000]
}

fn tone(freq: f32, ms: usize) -> Vec<f32> {
    let n = SR as usize * ms / 1000;
    (0..n)
        .map(|i| 0.3 * (2.0 * PI * freq * i as f32 / SR as f32).sin())
        .collect()
}

/// Each note held for 400 ms, separated by 300 ms of silence.
fn melody(freqs: &[f32]) -> Vec<f32> {
    let mut samples = silence(200);
    for &f in freqs {
        samples.extend(tone(f, 400));
        samples.extend(silence(300));
    }
    samples
}

fn exercise(text: &str) -> Exercise {
    Exercise::new("test", text.parse::<Score>().unwrap())
}

/// Receives until `pred` holds or the deadline passes.
fn wait_for(
    orchestrator: &DetectorOrchestrator,
    timeout: Duration,
    mut pred: impl FnMut(&OrchestratorEvent) -> bool,
) -> Vec<OrchestratorEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match orchestrator.events().recv_timeout(left) {
            Ok(event) => {
                let done = pred(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    seen
}

fn confirmed(events: &[OrchestratorEvent]) -> Vec<(Pitch, NoteSource)> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Confirmed(n) => Some((n.pitch, n.source)),
            _ => None,
        })
        .collect()
}

#[test]
fn monophonic_replay_follows_the_score_to_the_end() {
    let audio = melody(&[261.63, 293.66, 329.63]);
    let source = ReplaySource::new(audio, SR);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4 D4 E4"))
        .source(Box::new(source))
        .start()
        .unwrap();

    // The source runs dry, so the stream closes by itself.
    let events: Vec<_> = orchestrator.events().iter().collect();
    let timeline = orchestrator.stop().unwrap();

    assert_eq!(
        confirmed(&events),
        vec![
            (p("C4"), NoteSource::Monophonic),
            (p("D4"), NoteSource::Monophonic),
            (p("E4"), NoteSource::Monophonic),
        ]
    );
    assert!(events.contains(&OrchestratorEvent::Finished));
    assert_eq!(
        events.first(),
        Some(&OrchestratorEvent::Status(PipelineStatus::Running {
            routing: Routing::LiteOnly
        }))
    );
    assert_eq!(events.last(), Some(&OrchestratorEvent::Status(PipelineStatus::Stopped)));

    assert_eq!(timeline.pitches(), vec![p("C4"), p("D4"), p("E4")]);
    assert!(timeline.events().iter().all(|e| e.offset_ms.is_some()));
    let onsets: Vec<f64> = timeline.events().iter().map(|e| e.onset_ms).collect();
    assert!(onsets.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn unreachable_pro_degrades_to_lite_scoring() {
    let mut audio = silence(500);
    audio.extend(melody(&[261.63]));
    let source = ReplaySource::new(audio, SR).realtime(true);
    let pro = LocalProServer::new(EngineConfig::default().pro)
        .unwrap()
        .refuse_connects(u32::MAX);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&statuses);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4+E4+G4 C4"))
        .source(Box::new(source))
        .transport(Box::new(pro))
        .on_status(Box::new(move |s: &PipelineStatus| seen.lock().unwrap().push(s.clone())))
        .start()
        .unwrap();

    let events = wait_for(&orchestrator, Duration::from_secs(10), |e| {
        matches!(e, OrchestratorEvent::Confirmed(_))
    });
    orchestrator.stop();

    assert!(
        events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Status(PipelineStatus::Degraded { .. }))),
        "{events:?}"
    );
    assert_eq!(confirmed(&events), vec![(p("C4"), NoteSource::Monophonic)]);

    let statuses = statuses.lock().unwrap();
    assert_eq!(
        statuses.first(),
        Some(&PipelineStatus::Running {
            routing: Routing::LiteAndPro
        })
    );
    assert!(statuses.iter().any(|s| matches!(s, PipelineStatus::Degraded { .. })));
    assert_eq!(statuses.last(), Some(&PipelineStatus::Stopped));
}

#[test]
fn polyphonic_exercise_without_transport_starts_degraded() {
    let source = ReplaySource::new(silence(200), SR);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4+E4+G4"))
        .source(Box::new(source))
        .start()
        .unwrap();

    let events: Vec<_> = orchestrator.events().iter().collect();
    orchestrator.stop();
    assert!(matches!(
        events.get(1),
        Some(OrchestratorEvent::Status(PipelineStatus::Degraded { .. }))
    ));
}

#[test]
fn midi_input_is_scored_like_audio() {
    let source = ReplaySource::new(silence(20_000), SR).realtime(true);
    let mut config = EngineConfig::default();
    config.orchestrator.scoring = ScoringMode::Timed;
    let mut orchestrator = DetectorOrchestrator::builder(config)
        .exercise(exercise("C4@100 E4@600"))
        .source(Box::new(source))
        .start()
        .unwrap();

    orchestrator.submit_midi_at(p("C4"), 90, 120.0).unwrap();
    orchestrator.submit_midi_at(p("E4"), 90, 580.0).unwrap();
    let events = wait_for(&orchestrator, Duration::from_secs(5), |e| *e == OrchestratorEvent::Finished);
    orchestrator.stop();

    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Match(m) => Some((m.matched, m.note_index, m.timing_error_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec![(true, Some(0), 20), (true, Some(1), -20)]);
    assert_eq!(confirmed(&events), vec![(p("C4"), NoteSource::Midi), (p("E4"), NoteSource::Midi)]);
    assert_eq!(events.last(), Some(&OrchestratorEvent::Finished));
}

#[test]
fn switching_exercise_restarts_following() {
    let source = ReplaySource::new(silence(20_000), SR).realtime(true);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4 D4 E4"))
        .source(Box::new(source))
        .start()
        .unwrap();

    orchestrator.set_exercise(exercise("G4 A4 B4")).unwrap();
    assert_eq!(orchestrator.exercise().score.pitches().next(), Some(p("G4")));

    for name in ["G4", "A4", "B4"] {
        orchestrator.submit_midi(p(name), 80).unwrap();
    }
    let events = wait_for(&orchestrator, Duration::from_secs(5), |e| *e == OrchestratorEvent::Finished);
    orchestrator.stop();
    assert_eq!(events.last(), Some(&OrchestratorEvent::Finished));
}

#[test]
fn thresholds_are_validated_before_reaching_the_lite_path() {
    let source = ReplaySource::new(silence(5_000), SR).realtime(true);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4"))
        .source(Box::new(source))
        .start()
        .unwrap();

    let bad = GateThresholds {
        max_cmnd: 2.0,
        ..GateThresholds::default()
    };
    assert!(matches!(orchestrator.set_thresholds(bad), Err(FollowError::Config { .. })));
    assert!(orchestrator.set_thresholds(GateThresholds::default()).is_ok());

    orchestrator.stop();
    assert!(matches!(
        orchestrator.set_thresholds(GateThresholds::default()),
        Err(FollowError::ChannelClosed)
    ));
}

#[test]
fn stop_is_idempotent_and_closes_the_stream() {
    let source = ReplaySource::new(silence(60_000), SR).realtime(true);
    let mut orchestrator = DetectorOrchestrator::builder(EngineConfig::default())
        .exercise(exercise("C4"))
        .source(Box::new(source))
        .start()
        .unwrap();

    let started = Instant::now();
    assert!(orchestrator.stop().is_some());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(orchestrator.stop().is_none());
    assert!(orchestrator.is_finished());

    let events: Vec<_> = orchestrator.events().iter().collect();
    assert_eq!(events.last(), Some(&OrchestratorEvent::Status(PipelineStatus::Stopped)));
    assert!(orchestrator.submit_midi(p("C4"), 64).is_err());
}

#[test]
fn offline_analysis_gives_up_at_the_timeout() {
    let audio: Vec<f32> = (0..30).flat_map(|_| melody(&[440.0])).collect();
    let result = analyze_track(
        audio,
        SR,
        &EngineConfig::default(),
        OfflineMode::Monophonic,
        Duration::ZERO,
    );
    assert!(matches!(result, Err(FollowError::Timeout(_))));
}

#[test]
fn offline_analysis_transcribes_a_melody() {
    let audio = melody(&[261.63, 329.63, 392.0]);
    let events = analyze_track(
        audio,
        SR,
        &EngineConfig::default(),
        OfflineMode::Monophonic,
        Duration::from_secs(30),
    )
    .unwrap();
    let pitches: Vec<Pitch> = events.iter().map(|e| e.pitch).collect();
    assert_eq!(pitches, vec![p("C4"), p("E4"), p("G4")]);
    assert!(events.iter().all(|e| e.offset_ms.is_some()));
}
