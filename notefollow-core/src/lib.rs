// notefollow-core/src/lib.rs

//! The core logic for piano note detection and score following.
//! This crate turns a live audio stream into tentative and confirmed note
//! events, follows them through an expected score and reports timing.
//! It is completely headless and contains no UI code.

pub mod audio;
pub mod calibration;
pub mod config;
pub mod error;
pub mod events;
pub mod fft;
pub mod follower;
pub mod gate;
pub mod lite;
pub mod offline;
pub mod onset;
pub mod orchestrator;
pub mod pitch;
pub mod poly;
pub mod remote;
pub mod score;
pub mod spectral;
pub mod timing;
pub mod tuning;
pub mod window;

pub use audio::{AudioSource, CpalSource, ReplaySource};
pub use calibration::{CalibrationConfig, CalibrationPhase, Calibrator};
pub use config::{EngineConfig, GateThresholds};
pub use error::{FollowError, Result};
pub use events::{EventKind, MatchResult, NoteEvent, NoteSignal, NoteSource, TimingStatus};
pub use follower::{FollowMode, FollowerState, ScoreFollower};
pub use offline::{analyze_track, compare_transcriptions, OfflineMode, ParityReport};
pub use orchestrator::{
    DetectorOrchestrator, OrchestratorBuilder, OrchestratorEvent, PipelineStatus, Routing, ScoringMode,
};
pub use pitch::{Detection, MonophonicPitchDetector};
pub use poly::{DetectedNote, PolyphonicDetector};
pub use remote::{LocalProServer, ProTransport};
pub use score::{Exercise, ExpectedNote, Score};
pub use timing::TimingFollower;
pub use tuning::Pitch;
pub use window::{AudioWindow, WindowBuffer};
