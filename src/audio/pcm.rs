//! PCM16 helpers shared by the capture and playback paths
//!
//! The live service expects 16 kHz mono little-endian PCM16 wrapped in
//! base64, and replies with 24 kHz mono PCM16 in the same encoding.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Sample rate of audio sent to the live service
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of model audio received from the live service
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Convert a float sample in [-1.0, 1.0] to i16, clamping out-of-range input.
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Convert an i16 sample back to a float in [-1.0, 1.0].
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Mix interleaved multi-channel samples down to mono by averaging each frame.
pub fn to_mono(interleaved: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Resample mono audio from `source_rate` to `target_rate`.
///
/// Integer downsampling ratios (48 kHz → 16 kHz) average each group of
/// samples. Any other ratio falls back to linear interpolation, which is
/// adequate for speech.
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| {
                // i64 keeps large chunks from overflowing
                let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
                (sum / chunk.len() as i64) as i16
            })
            .collect();
    }

    let out_len = ((samples.len() as u64 * target_rate as u64) / source_rate as u64) as usize;
    let step = source_rate as f64 / target_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[next] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Encode PCM16 samples as base64 little-endian bytes.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

/// Decode base64 little-endian PCM16. A trailing odd byte is dropped.
pub fn decode_pcm16(data: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = STANDARD.decode(data)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// A near-silent frame (alternating ±1 LSB) of `duration_ms` at `sample_rate`.
pub fn near_silence(duration_ms: u32, sample_rate: u32) -> Vec<i16> {
    let len = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    (0..len).map(|i| if i % 2 == 0 { 1 } else { -1 }).collect()
}

/// Playback duration of `sample_count` mono samples.
pub fn duration_of(sample_count: usize, sample_rate: u32) -> std::time::Duration {
    if sample_rate == 0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::from_micros(sample_count as u64 * 1_000_000 / sample_rate as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_to_mono_averages_frames() {
        let stereo = vec![100i16, 300, -200, 200];
        assert_eq!(to_mono(&stereo, 2), vec![200, 0]);
        assert_eq!(to_mono(&stereo, 1), stereo);
    }

    #[test]
    fn test_resample_integer_ratio() {
        // 48kHz → 16kHz (3:1)
        let input = vec![100i16, 200, 300, 400, 500, 600];
        let output = resample(&input, 48_000, 16_000);
        assert_eq!(output, vec![200, 500]);
    }

    #[test]
    fn test_resample_same_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(resample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn test_resample_fractional_ratio_length() {
        // 44.1kHz → 16kHz
        let input = vec![0i16; 4410];
        let output = resample(&input, 44_100, 16_000);
        assert_eq!(output.len(), 1600);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let input = vec![0i16, 100];
        let output = resample(&input, 16_000, 32_000);
        assert_eq!(output, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_resample_zero_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(resample(&input, 48_000, 0), input);
        assert_eq!(resample(&input, 0, 16_000), input);
    }

    #[test]
    fn test_pcm16_encoding_is_little_endian() {
        let encoded = encode_pcm16(&[0x1234, 0x5678]);
        let bytes = STANDARD.decode(&encoded).unwrap();
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
        assert_eq!(decode_pcm16(&encoded).unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_decode_drops_odd_byte() {
        let encoded = STANDARD.encode([0x01u8, 0x00, 0x7f]);
        assert_eq!(decode_pcm16(&encoded).unwrap(), vec![1]);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(decode_pcm16("not base64!!").is_err());
    }

    #[test]
    fn test_near_silence() {
        let frame = near_silence(100, 16_000);
        assert_eq!(frame.len(), 1600);
        assert!(frame.iter().all(|s| s.abs() <= 1));
    }

    #[test]
    fn test_duration_of() {
        assert_eq!(duration_of(24_000, 24_000).as_millis(), 1000);
        assert_eq!(duration_of(2400, 24_000).as_millis(), 100);
        assert_eq!(duration_of(10, 0), std::time::Duration::ZERO);
    }
}
