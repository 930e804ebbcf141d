//! Sample file I/O: raw signed 16-bit little-endian PCM, or WAV by extension.

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs;
use std::path::Path;
use voxproc_core::constants::SAMPLE_RATE;

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Reads mono 48 kHz samples. Raw files are taken as S16LE as-is.
pub fn read_samples(path: &Path) -> Result<Vec<i16>> {
    if is_wav(path) {
        return read_wav(path);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.len() % 2 != 0 {
        log::warn!(
            "{}: odd byte count, dropping the trailing byte",
            path.display()
        );
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

pub fn write_samples(path: &Path, samples: &[i16]) -> Result<()> {
    if is_wav(path) {
        return write_wav(path, samples);
    }
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_wav(path: &Path) -> Result<Vec<i16>> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        bail!(
            "{}: expected mono 16-bit PCM, got {} channel(s) {}-bit {:?}",
            path.display(),
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    if spec.sample_rate != SAMPLE_RATE {
        bail!(
            "{}: expected {} Hz, got {} Hz",
            path.display(),
            SAMPLE_RATE,
            spec.sample_rate
        );
    }
    reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to decode {}", path.display()))
}

fn write_wav(path: &Path, samples: &[i16]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(path, spec).with_context(|| format!("Failed to create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
