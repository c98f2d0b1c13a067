// Frame codec for PCM16 audio on the wire
//
// Samples are clamped to [-1, 1], quantized to signed 16-bit
// (round(s * 32768), saturated), packed little-endian and base64 encoded so
// the frame can travel inside a JSON text message. Decoding is the exact
// inverse; byte order must match or playback turns into static.

use base64::Engine;

use crate::error::CodecError;

const SCALE: f32 = 32768.0;

/// Quantize one sample to i16.
pub fn quantize(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = (clamped * SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert float samples to little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Convert little-endian PCM16 bytes back to float samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / SCALE)
        .collect())
}

/// Encode a block of samples into a wire frame.
pub fn encode(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16(samples))
}

/// Decode a wire frame into samples.
pub fn decode(frame: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(frame)
        .map_err(|e| CodecError::Encoding(e.to_string()))?;

    decode_pcm16(&bytes)
}
