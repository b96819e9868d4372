//! Track decode and resample to the mixer's fixed output format. Runs on the
//! blocking thread pool — symphonia decode is CPU-bound and rubato's
//! buffered resampler blocks waiting for full chunks, neither belongs on an
//! async worker.

use std::path::Path;

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use latentradio_proto::errors::{ErrorKind, Outcome};

/// Interleaved PCM samples at the mixer's output format.
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
}

/// Decodes `path` to interleaved `f32` PCM at `target_sample_rate` /
/// `target_channels`, blocking the calling thread. Callers run this inside
/// `spawn_blocking`.
pub fn decode_track(
    path: &Path,
    target_sample_rate: u32,
    target_channels: u16,
) -> Outcome<DecodedAudio> {
    let file = std::fs::File::open(path)
        .map_err(|e| ErrorKind::DecodeFailed(format!("{}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| ErrorKind::DecodeFailed(format!("probe failed: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ErrorKind::DecodeFailed("no audio track in file".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params.sample_rate.unwrap_or(target_sample_rate);
    let source_channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| ErrorKind::DecodeFailed(format!("no decoder: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(ErrorKind::DecodeFailed(format!("packet read failed: {e}")));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(ErrorKind::DecodeFailed(format!("decode failed: {e}"))),
        };
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        append_channel_converted(&mut samples, buf.samples(), source_channels, target_channels);
    }

    let samples = if source_rate == target_sample_rate {
        samples
    } else {
        resample(&samples, source_rate, target_sample_rate, target_channels)
    };

    Ok(DecodedAudio {
        samples,
        channels: target_channels,
    })
}

fn append_channel_converted(out: &mut Vec<f32>, input: &[f32], source_channels: u16, target_channels: u16) {
    match (source_channels, target_channels) {
        (s, t) if s == t => out.extend_from_slice(input),
        (1, 2) => {
            for &s in input {
                out.push(s);
                out.push(s);
            }
        }
        (2, 1) => {
            for chunk in input.chunks(2) {
                if chunk.len() == 2 {
                    out.push((chunk[0] + chunk[1]) / 2.0);
                }
            }
        }
        (s, t) => {
            let s = s as usize;
            let t = t as usize;
            for chunk in input.chunks(s) {
                for i in 0..t {
                    out.push(*chunk.get(i).unwrap_or(&0.0));
                }
            }
        }
    }
}

/// Resamples interleaved PCM with rubato's fixed-input FFT resampler,
/// processing whole chunks and discarding the resampler's own warm-up
/// latency padding at the start of the first chunk.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32, channels: u16) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }
    let channels = channels as usize;
    let frames = samples.len() / channels;
    let chunk_size = 2048.min(frames.max(1));

    let mut resampler = match FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, 2, channels) {
        Ok(r) => r,
        Err(_) => return samples.to_vec(),
    };

    let mut deinterleaved: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks(channels) {
        for (ch, value) in frame.iter().enumerate() {
            deinterleaved[ch].push(*value);
        }
    }

    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut offset = 0;
    while offset < frames {
        let end = (offset + chunk_size).min(frames);
        let mut input_chunk: Vec<Vec<f32>> = deinterleaved.iter().map(|c| c[offset..end].to_vec()).collect();
        if end - offset < chunk_size {
            for channel in &mut input_chunk {
                channel.resize(chunk_size, 0.0);
            }
        }
        match resampler.process(&input_chunk, None) {
            Ok(chunk_out) => {
                for (ch, data) in chunk_out.into_iter().enumerate() {
                    output[ch].extend(data);
                }
            }
            Err(_) => break,
        }
        offset = end;
    }

    let output_frames = output.first().map(|c| c.len()).unwrap_or(0);
    let mut interleaved = Vec::with_capacity(output_frames * channels);
    for frame in 0..output_frames {
        for channel in &output {
            interleaved.push(channel[frame]);
        }
    }
    interleaved
}

/// Equal-power crossfade gain at progress `t` in `[0.0, 1.0]`: outgoing
/// lane's gain is `cos(t * pi/2)`, incoming lane's is `sin(t * pi/2)`, so
/// `outgoing^2 + incoming^2 == 1` and perceived loudness stays flat.
pub fn equal_power_gains(t: f64) -> (f64, f64) {
    let t = t.clamp(0.0, 1.0);
    let angle = t * std::f64::consts::FRAC_PI_2;
    (angle.cos(), angle.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_power_gains_preserve_energy() {
        for i in 0..=10 {
            let t = i as f64 / 10.0;
            let (out, inc) = equal_power_gains(t);
            assert!((out * out + inc * inc - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn equal_power_gains_at_endpoints() {
        let (out, inc) = equal_power_gains(0.0);
        assert!((out - 1.0).abs() < 1e-9);
        assert!(inc.abs() < 1e-9);
        let (out, inc) = equal_power_gains(1.0);
        assert!(out.abs() < 1e-9);
        assert!((inc - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mono_to_stereo_duplicates_samples() {
        let mut out = Vec::new();
        append_channel_converted(&mut out, &[0.1, 0.2], 1, 2);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn stereo_to_mono_averages_channels() {
        let mut out = Vec::new();
        append_channel_converted(&mut out, &[0.0, 1.0], 2, 1);
        assert_eq!(out, vec![0.5]);
    }
}
