//! # notefollow-live
//!
//! Headless front end: captures the default input device, runs the detector
//! orchestrator against a score and prints every event as one JSON line.
//!
//! ```text
//! notefollow-live --score scale.txt [--config engine.json] [--seconds 60]
//!                 [--poly] [--timed] [--verbose]
//! notefollow-live --notes "C4 D4 E4 F4 G4"
//! notefollow-live --write-config engine.json
//! ```

use anyhow::{bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notefollow_core::orchestrator::{OrchestratorEvent, PipelineStatus, ScoringMode};
use notefollow_core::remote::LocalProServer;
use notefollow_core::{CpalSource, DetectorOrchestrator, EngineConfig, Exercise, Score};

#[derive(Debug, Default)]
struct Args {
    score: Option<String>,
    notes: Option<String>,
    config: Option<String>,
    write_config: Option<String>,
    seconds: Option<u64>,
    poly: bool,
    timed: bool,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--score" => args.score = Some(value("--score")?),
            "--notes" => args.notes = Some(value("--notes")?),
            "--config" => args.config = Some(value("--config")?),
            "--write-config" => args.write_config = Some(value("--write-config")?),
            "--seconds" => {
                let raw = value("--seconds")?;
                args.seconds = Some(raw.parse().with_context(|| format!("bad --seconds `{raw}`"))?);
            }
            "--poly" => args.poly = true,
            "--timed" => args.timed = true,
            "--verbose" | "-v" => args.verbose = true,
            other => bail!("unknown argument `{other}`"),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading config {path}"))?,
        None => EngineConfig::default(),
    };
    if let Some(path) = &args.write_config {
        config.save(path).with_context(|| format!("writing config {path}"))?;
        log::info!("[MAIN] wrote configuration to {path}");
        return Ok(());
    }
    if args.timed {
        config.orchestrator.scoring = ScoringMode::Timed;
    }

    let score = match (&args.score, &args.notes) {
        (Some(path), _) => Score::load(path).with_context(|| format!("loading score {path}"))?,
        (None, Some(text)) => text.parse::<Score>().context("parsing --notes")?,
        (None, None) => bail!("pass --score <file> or --notes \"C4 D4 E4\""),
    };
    let name = args.score.clone().unwrap_or_else(|| "inline".into());
    let exercise = Exercise::new(name, score);
    let exercise = if args.poly {
        exercise.with_polyphony(true)
    } else {
        exercise
    };

    let source = CpalSource::new().context("opening the default input device")?;
    let pro = LocalProServer::new(config.pro.clone()).context("configuring the pro server")?;
    let seconds = args.seconds.unwrap_or(30);

    let mut orchestrator = DetectorOrchestrator::builder(config)
        .exercise(Arc::new(exercise))
        .source(Box::new(source))
        .transport(Box::new(pro))
        .on_status(Box::new(|status: &PipelineStatus| {
            if let PipelineStatus::Degraded { reason } = status {
                log::warn!("[MAIN] running without Pro: {reason}");
            }
        }))
        .start()
        .context("starting the orchestrator")?;
    log::info!("[MAIN] listening for {seconds} s");

    let deadline = Instant::now() + Duration::from_secs(seconds);
    loop {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match orchestrator.events().recv_timeout(left) {
            Ok(event) => {
                let finished = event == OrchestratorEvent::Finished;
                if let OrchestratorEvent::Match(result) = &event {
                    log::debug!(
                        "[MAIN] {} -> {:?} ({:+} ms)",
                        result.detected_note(),
                        result.timing_status,
                        result.timing_error_ms
                    );
                }
                println!("{}", serde_json::to_string(&event).context("encoding event")?);
                if finished {
                    log::info!("[MAIN] score complete");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(timeline) = orchestrator.stop() {
        log::info!("[MAIN] {} confirmed notes", timeline.len());
    }
    Ok(())
}
