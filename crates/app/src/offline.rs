//! File-to-file processing, driving a session the way a streaming pipeline
//! would: fixed-size chunks that ignore frame boundaries, far end first.

use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;
use voxproc_core::{DelayAdjustment, EngineKind, Profile, Session, SessionConfig};

pub struct ProcessOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub reverse: Option<PathBuf>,
    pub profile: Profile,
    pub engine: EngineKind,
    pub delay_ms: i32,
    pub gain_db: Option<i32>,
    pub manual_gain: bool,
    pub chunk: usize,
    pub auto_delay: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub samples: usize,
    pub frames: usize,
    pub reverse_frames: usize,
    pub delay_moves: usize,
    pub final_delay_ms: i32,
    /// Poor-delay percentage the delay controller saw last. `None` when it
    /// never got metrics (or never ran).
    pub last_poor_delays: Option<i32>,
    /// Chunks after which the engine reported voice. `None` without voice detection.
    pub voice_chunks: Option<usize>,
}

pub fn process_file(options: &ProcessOptions) -> Result<ProcessReport> {
    let mut near = crate::pcm::read_samples(&options.input)?;
    let far = match &options.reverse {
        Some(path) => Some(crate::pcm::read_samples(path)?),
        None => None,
    };

    let config = SessionConfig::new(options.profile, options.delay_ms).with_engine(options.engine);
    let mut session = Session::with_config(config).context("Failed to create session")?;
    if let Some(db) = options.gain_db {
        session.set_gain(db, options.manual_gain);
    }

    let report = run_session(&mut session, &mut near, far.as_deref(), options)?;
    crate::pcm::write_samples(&options.output, &near)?;

    info!(
        "Processed {} samples ({} frames), final delay {}ms",
        report.samples, report.frames, report.final_delay_ms
    );
    Ok(report)
}

fn run_session(
    session: &mut Session,
    near: &mut [i16],
    far: Option<&[i16]>,
    options: &ProcessOptions,
) -> Result<ProcessReport> {
    let chunk_len = options.chunk.max(1);
    let mut report = ProcessReport {
        samples: near.len(),
        ..ProcessReport::default()
    };
    let mut voice_chunks = 0usize;
    let mut voice_supported = false;

    for (index, chunk) in near.chunks_mut(chunk_len).enumerate() {
        if let Some(far) = far {
            let start = (index * chunk_len).min(far.len());
            let end = (start + chunk.len()).min(far.len());
            report.reverse_frames += session.process_reverse_chunk(&far[start..end]);
        }

        report.frames += session.process_chunk(chunk);

        if let Some(voice) = session.has_voice() {
            voice_supported = true;
            if voice {
                voice_chunks += 1;
            }
        }

        if options.auto_delay {
            if let DelayAdjustment::Moved { from, to } = session.adjust_delay() {
                info!("Stream delay {}ms -> {}ms", from, to);
                report.delay_moves += 1;
            }
        }
    }

    report.final_delay_ms = session.stream_delay_ms();
    report.last_poor_delays = session.last_metrics().poor_delays_percent();
    report.voice_chunks = voice_supported.then_some(voice_chunks);
    Ok(report)
}
