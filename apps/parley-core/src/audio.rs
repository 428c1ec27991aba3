//! PCM16 helpers for the client audio path.

pub const DEFAULT_SILENCE_THRESHOLD: f64 = 500.0;

/// Little-endian PCM16 bytes to samples. A trailing odd byte is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}

/// Root-mean-square energy over whole samples; `None` when there are none.
pub fn rms_pcm16_le(bytes: &[u8]) -> Option<f64> {
    let mut n = 0usize;
    let mut sum_sq = 0f64;
    for c in bytes.chunks_exact(2) {
        let s = i16::from_le_bytes([c[0], c[1]]) as f64;
        sum_sq += s * s;
        n += 1;
    }
    if n == 0 { return None; }
    Some((sum_sq / n as f64).sqrt())
}

/// True when the chunk carries no speech energy above `threshold`.
pub fn is_silence(bytes: &[u8], threshold: f64) -> bool {
    match rms_pcm16_le(bytes) {
        Some(rms) => rms < threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn zeroed_buffers_are_silence() {
        for len in [2usize, 64, 640, 3200] {
            assert!(is_silence(&vec![0u8; len], DEFAULT_SILENCE_THRESHOLD), "len {len}");
        }
    }

    #[test]
    fn empty_and_single_byte_buffers_are_silence() {
        assert!(is_silence(&[], DEFAULT_SILENCE_THRESHOLD));
        assert!(is_silence(&[0x7f], DEFAULT_SILENCE_THRESHOLD));
    }

    #[test]
    fn loud_signal_is_not_silence() {
        let loud = pcm(&[8000, -8000, 8000, -8000]);
        assert!(!is_silence(&loud, DEFAULT_SILENCE_THRESHOLD));
    }

    #[test]
    fn threshold_is_exclusive() {
        // constant 500 has RMS exactly 500, which is not below the threshold
        let edge = pcm(&[500, -500]);
        assert!(!is_silence(&edge, 500.0));
        assert!(is_silence(&pcm(&[499, -499]), 500.0));
    }

    #[test]
    fn trailing_odd_byte_is_ignored() {
        let mut bytes = pcm(&[0, 0]);
        bytes.push(0xff);
        assert_eq!(decode_pcm16_le(&bytes), vec![0, 0]);
        assert!(is_silence(&bytes, DEFAULT_SILENCE_THRESHOLD));
    }
}
