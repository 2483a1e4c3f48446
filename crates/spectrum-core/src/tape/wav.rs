//! WAV tape input and output.
//!
//! Playback accepts mono PCM, 8 or 16 bit, and squares it up into a
//! transition waveform for the player. Recording writes 16-bit mono PCM,
//! with support for appending to an existing file.

use std::io::Read;
use std::path::Path;

use crate::beeper::CPU_HZ;
use crate::tape::TapeSource;

/// Import a WAV file as a tape waveform.
///
/// # Errors
///
/// Non-PCM, non-mono or unsupported bit depths reject the file.
pub fn import(path: &Path) -> Result<TapeSource, String> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| format!("cannot open WAV {}: {e}", path.display()))?;
    decode(reader)
}

/// Import from an in-memory WAV image.
pub fn import_bytes(data: &[u8]) -> Result<TapeSource, String> {
    let reader = hound::WavReader::new(std::io::Cursor::new(data))
        .map_err(|e| format!("cannot parse WAV: {e}"))?;
    decode(reader)
}

fn decode<R: Read>(mut reader: hound::WavReader<R>) -> Result<TapeSource, String> {
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(format!(
            "WAV must be mono, this file has {} channels",
            spec.channels
        ));
    }
    if spec.sample_format != hound::SampleFormat::Int
        || !matches!(spec.bits_per_sample, 8 | 16)
    {
        return Err(format!(
            "WAV must be 8- or 16-bit PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        ));
    }

    let samples: Vec<i32> = reader
        .samples::<i32>()
        .collect::<Result<_, _>>()
        .map_err(|e| format!("WAV sample read failed: {e}"))?;
    if samples.is_empty() {
        return Err("WAV contains no samples".to_string());
    }

    // Square the signal up around the midpoint of its actual excursion;
    // tape recordings routinely carry a DC offset.
    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    let threshold = min + (max - min) / 2;

    let tstates_per_sample = CPU_HZ / f64::from(spec.sample_rate);
    let initial_level = samples[0] > threshold;

    let mut durations = Vec::new();
    let mut current = initial_level;
    let mut run: u64 = 0;
    for &s in &samples {
        let level = s > threshold;
        if level == current {
            run += 1;
        } else {
            durations.push((run as f64 * tstates_per_sample).round() as u32);
            current = level;
            run = 1;
        }
    }
    durations.push((run as f64 * tstates_per_sample).round() as u32);

    Ok(TapeSource::Waveform {
        initial_level,
        durations,
    })
}

/// Write a fresh 16-bit mono WAV.
pub fn write_samples(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| format!("cannot create WAV {}: {e}", path.display()))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| format!("WAV write failed: {e}"))?;
    }
    writer
        .finalize()
        .map_err(|e| format!("WAV finalise failed: {e}"))
}

/// Append samples to an existing WAV's data chunk, rewriting the RIFF
/// and data sizes.
pub fn append_samples(path: &Path, samples: &[i16]) -> Result<(), String> {
    let mut writer = hound::WavWriter::append(path)
        .map_err(|e| format!("cannot append to WAV {}: {e}", path.display()))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| format!("WAV append failed: {e}"))?;
    }
    writer
        .finalize()
        .map_err(|e| format!("WAV finalise failed: {e}"))
}

/// Read all samples from an existing 16-bit mono WAV (head preservation
/// when re-recording over a tape).
pub fn read_samples(path: &Path) -> Result<(Vec<i16>, u32), String> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| format!("cannot open WAV {}: {e}", path.display()))?;
    let spec = reader.spec();
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(|e| format!("WAV sample read failed: {e}"))?;
    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
            for &s in samples {
                writer.write_sample(s).expect("sample");
            }
            writer.finalize().expect("finalize");
        }
        cursor.into_inner()
    }

    #[test]
    fn square_wave_becomes_runs() {
        // 10 high, 20 low, 10 high at 35 kHz → 100 T per sample.
        let mut samples = Vec::new();
        samples.extend(std::iter::repeat_n(20_000i16, 10));
        samples.extend(std::iter::repeat_n(-20_000i16, 20));
        samples.extend(std::iter::repeat_n(20_000i16, 10));
        let raw = wav_bytes(&samples, 35_000);

        let source = import_bytes(&raw).expect("import");
        match source {
            TapeSource::Waveform {
                initial_level,
                durations,
            } => {
                assert!(initial_level);
                assert_eq!(durations, vec![1000, 2000, 1000]);
            }
            TapeSource::Blocks(_) => panic!("expected waveform"),
        }
    }

    #[test]
    fn dc_offset_is_tolerated() {
        // Same square wave riding on a +5000 offset.
        let mut samples = Vec::new();
        samples.extend(std::iter::repeat_n(15_000i16, 5));
        samples.extend(std::iter::repeat_n(-5_000i16, 5));
        let raw = wav_bytes(&samples, 35_000);

        let source = import_bytes(&raw).expect("import");
        match source {
            TapeSource::Waveform { durations, .. } => {
                assert_eq!(durations.len(), 2);
            }
            TapeSource::Blocks(_) => panic!("expected waveform"),
        }
    }

    #[test]
    fn empty_wav_rejected() {
        let raw = wav_bytes(&[], 44_100);
        assert!(import_bytes(&raw).is_err());
    }

    #[test]
    fn stereo_rejected() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
            writer.write_sample(0i16).expect("sample");
            writer.write_sample(0i16).expect("sample");
            writer.finalize().expect("finalize");
        }
        let err = import_bytes(&cursor.into_inner()).expect_err("must reject stereo");
        assert!(err.contains("mono"));
    }
}
