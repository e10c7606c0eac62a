// Following a played sequence through both followers.

use std::sync::Arc;

use notefollow_core::follower::{FollowerConfig, FollowerOutput};
use notefollow_core::timing::TimingConfig;
use notefollow_core::{FollowMode, Pitch, Score, ScoreFollower, TimingFollower, TimingStatus};

fn p(name: &str) -> Pitch {
    name.parse().unwrap()
}

fn score(text: &str) -> Arc<Score> {
    Arc::new(text.parse().unwrap())
}

fn matches(outputs: &[FollowerOutput]) -> Vec<(bool, Option<usize>)> {
    outputs
        .iter()
        .filter_map(|o| match o {
            FollowerOutput::Match(m) => Some((m.matched, m.note_index)),
            _ => None,
        })
        .collect()
}

#[test]
fn joins_mid_scale_then_loses_track() {
    let mut follower = ScoreFollower::new(score("C4 D4 E4 F4 G4"), FollowerConfig::default()).unwrap();

    // Starting on the second note.
    assert!(matches(&follower.process(p("D4"), 500.0)).is_empty());
    assert!(matches(&follower.process(p("E4"), 1000.0)).is_empty());
    let outputs = follower.process(p("F4"), 1500.0);
    assert_eq!(matches(&outputs), vec![(true, Some(3))]);
    assert_eq!(follower.state().mode, FollowMode::Locked);
    assert_eq!(follower.state().position, Some(3));

    // One wrong note: judged against G4, position kept.
    let outputs = follower.process(p("B4"), 2000.0);
    assert_eq!(matches(&outputs), vec![(false, Some(4))]);
    assert_eq!(follower.state().position, Some(3));
    assert_eq!(follower.state().consecutive_errors, 1);

    for t in 1..4 {
        follower.process(p("B4"), 2000.0 + 500.0 * t as f64);
        assert_eq!(follower.state().mode, FollowMode::Locked);
    }
    follower.process(p("B4"), 4000.0);
    assert_eq!(follower.state().mode, FollowMode::Lost);
}

#[test]
fn finishing_the_score_is_reported_once() {
    let mut follower = ScoreFollower::new(score("C4 D4 E4 F4"), FollowerConfig::default()).unwrap();
    let mut finished = 0;
    for (i, name) in ["C4", "D4", "E4", "F4", "F4"].iter().enumerate() {
        finished += follower
            .process(p(name), i as f64 * 500.0)
            .iter()
            .filter(|o| matches!(o, FollowerOutput::Finished))
            .count();
    }
    assert_eq!(finished, 1);
    assert!(follower.is_finished());
}

#[test]
fn timed_notes_are_classified_against_their_targets() {
    let mut timing = TimingFollower::new(score("C4@1000 E4@2000"), TimingConfig::default()).unwrap();

    let on_time = timing.process(p("C4"), 1020.0).unwrap();
    assert!(on_time.matched);
    assert_eq!(on_time.timing_status, TimingStatus::OnTime);
    assert_eq!(on_time.timing_error_ms, 20);

    let late = timing.process(p("E4"), 2300.0).unwrap();
    assert!(late.matched);
    assert_eq!(late.note_index, Some(1));
    assert_eq!(late.timing_status, TimingStatus::Late);
    assert_eq!(late.timing_error_ms, 300);
    assert!(timing.is_complete());
}

#[test]
fn chord_members_match_in_any_order() {
    let mut timing = TimingFollower::new(score("C4+E4+G4@1000"), TimingConfig::default()).unwrap();
    for (name, at) in [("G4", 990.0), ("C4", 1010.0), ("E4", 1030.0)] {
        let result = timing.process(p(name), at).unwrap();
        assert!(result.matched, "{name}");
    }
    assert!(timing.is_complete());
}

#[test]
fn unplayed_notes_are_marked_missed_as_time_passes() {
    let mut timing = TimingFollower::new(score("C4@0 D4@500 E4@1000 F4@1500"), TimingConfig::default()).unwrap();
    timing.process(p("C4"), 10.0);

    let missed: Vec<usize> = timing.advance(1600.0).iter().map(|n| n.index).collect();
    assert_eq!(missed, vec![1, 2]);
    assert!(timing.advance(1600.0).is_empty());

    let summary = timing.summary();
    assert_eq!(summary.on_time, 1);
    assert_eq!(summary.missed, 2);
    assert_eq!(summary.pending, 1);
}

#[test]
fn tempo_fit_detects_a_slow_performance() {
    let mut timing = TimingFollower::new(score("C4@0 D4@500 E4@1000 F4@1500"), TimingConfig::default()).unwrap();
    for (name, at) in [("C4", 0.0), ("D4", 550.0), ("E4", 1100.0), ("F4", 1650.0)] {
        assert!(timing.process(p(name), at).unwrap().matched);
    }

    let fit = timing.tempo_fit().unwrap();
    assert!((fit.ratio - 1.1).abs() < 1e-6, "{fit:?}");
    assert!(fit.offset_ms.abs() < 1e-6);
    assert_eq!(fit.samples, 4);
    assert!(!fit.is_rushing());
}
