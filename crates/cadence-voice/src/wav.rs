//! RIFF/WAVE container handling
//!
//! Locates the `data` chunk inside a (possibly still growing) WAV buffer and
//! hands back the raw PCM behind it. When no `data` chunk can be found the
//! parser falls back to skipping a fixed-size header; that path is reported
//! through [`HeaderStrip::Fallback`] so callers can tell a real parse from a
//! guess.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Size of the canonical PCM WAV header
pub const CANONICAL_HEADER_LEN: usize = 44;

const RIFF_PREAMBLE_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

/// Which path produced the PCM slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStrip {
    /// A `data` chunk was located by walking the chunk list
    DataChunk,
    /// No `data` chunk found; a fixed header length was skipped
    Fallback,
}

/// Contents of the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WavFormat {
    /// 1 = integer PCM
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            audio_format: 1,
            channels,
            sample_rate,
            bits_per_sample: 16,
        }
    }

    pub fn block_align(&self) -> u32 {
        u32::from(self.channels) * u32::from(self.bits_per_sample) / 8
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align()
    }

    /// Playback length of `pcm_len` bytes in this format
    pub fn duration_ms(&self, pcm_len: usize) -> u64 {
        match u64::from(self.byte_rate()) {
            0 => 0,
            rate => pcm_len as u64 * 1000 / rate,
        }
    }

    /// Canonical 44-byte header announcing `data_len` bytes of PCM
    pub fn header(&self, data_len: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(CANONICAL_HEADER_LEN);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36u32.saturating_add(data_len)).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&self.audio_format.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.byte_rate().to_le_bytes());
        out.extend_from_slice(&(self.block_align() as u16).to_le_bytes());
        out.extend_from_slice(&self.bits_per_sample.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out
    }

    /// Header followed by `pcm`
    pub fn encode(&self, pcm: &[u8]) -> Vec<u8> {
        let mut out = self.header(pcm.len() as u32);
        out.extend_from_slice(pcm);
        out
    }
}

/// Raw PCM located inside a container buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrippedPcm<'a> {
    pub pcm: &'a [u8],
    pub header_len: usize,
    pub strip: HeaderStrip,
    pub format: Option<WavFormat>,
}

/// Strip the container header from `bytes`.
///
/// A `data` chunk whose declared size is zero or larger than what is present
/// is treated as still being written, and runs to the end of the buffer.
/// Without a `data` chunk, `fallback_header_len` bytes are skipped; a buffer
/// no longer than that yields no PCM.
pub fn strip_header(bytes: &[u8], fallback_header_len: usize) -> StrippedPcm<'_> {
    let mut format = None;
    let mut offset = RIFF_PREAMBLE_LEN;

    while offset + CHUNK_HEADER_LEN <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4) as usize;
        let body = offset + CHUNK_HEADER_LEN;

        if id == b"data" {
            let available = bytes.len() - body;
            let len = if size == 0 { available } else { size.min(available) };
            debug!("📊 Extracted PCM: {} bytes (header was {} bytes)", len, body);
            return StrippedPcm {
                pcm: &bytes[body..body + len],
                header_len: body,
                strip: HeaderStrip::DataChunk,
                format,
            };
        }

        if id == b"fmt " && body + 16 <= bytes.len() {
            format = Some(WavFormat {
                audio_format: read_u16(bytes, body),
                channels: read_u16(bytes, body + 2),
                sample_rate: read_u32(bytes, body + 4),
                bits_per_sample: read_u16(bytes, body + 14),
            });
        }

        // Chunks are word aligned
        offset = match body.checked_add(size + (size & 1)) {
            Some(next) => next,
            None => break,
        };
    }

    warn!("⚠️ No data chunk found, skipping {} header bytes", fallback_header_len);
    let header_len = fallback_header_len.min(bytes.len());
    StrippedPcm {
        pcm: &bytes[header_len..],
        header_len,
        strip: HeaderStrip::Fallback,
        format,
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_is_stripped() {
        let format = WavFormat::pcm16(16_000, 1);
        let pcm: Vec<u8> = (0..100u8).collect();
        let wav = format.encode(&pcm);

        let stripped = strip_header(&wav, CANONICAL_HEADER_LEN);
        assert_eq!(stripped.strip, HeaderStrip::DataChunk);
        assert_eq!(stripped.header_len, 44);
        assert_eq!(stripped.pcm, &pcm[..]);
        assert_eq!(stripped.format, Some(format));
    }

    #[test]
    fn test_extra_chunks_are_skipped() {
        let format = WavFormat::pcm16(48_000, 2);
        let header = format.header(4);
        // RIFF preamble + fmt chunk, then an odd-sized LIST chunk with a pad byte
        let mut wav = header[..36].to_vec();
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&3u32.to_le_bytes());
        wav.extend_from_slice(&[7, 7, 7, 0]);
        wav.extend_from_slice(&header[36..]);
        wav.extend_from_slice(&[1, 2, 3, 4]);

        let stripped = strip_header(&wav, CANONICAL_HEADER_LEN);
        assert_eq!(stripped.strip, HeaderStrip::DataChunk);
        assert_eq!(stripped.header_len, 56);
        assert_eq!(stripped.pcm, &[1, 2, 3, 4]);
        assert_eq!(stripped.format.map(|f| f.channels), Some(2));
    }

    #[test]
    fn test_growing_data_chunk_runs_to_end() {
        let format = WavFormat::pcm16(16_000, 1);
        let mut wav = format.header(0);
        wav.extend_from_slice(&[9; 10]);

        let stripped = strip_header(&wav, CANONICAL_HEADER_LEN);
        assert_eq!(stripped.strip, HeaderStrip::DataChunk);
        assert_eq!(stripped.pcm.len(), 10);
    }

    #[test]
    fn test_declared_size_caps_pcm() {
        let format = WavFormat::pcm16(16_000, 1);
        let mut wav = format.header(4);
        wav.extend_from_slice(&[1, 2, 3, 4, 0xAA, 0xBB]);

        let stripped = strip_header(&wav, CANONICAL_HEADER_LEN);
        assert_eq!(stripped.pcm, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_fallback_is_observable() {
        let bytes = vec![0u8; 60];
        let stripped = strip_header(&bytes, CANONICAL_HEADER_LEN);
        assert_eq!(stripped.strip, HeaderStrip::Fallback);
        assert_eq!(stripped.header_len, 44);
        assert_eq!(stripped.pcm.len(), 16);
    }

    #[test]
    fn test_fallback_on_short_buffer_yields_nothing() {
        let stripped = strip_header(&[1, 2, 3], CANONICAL_HEADER_LEN);
        assert_eq!(stripped.strip, HeaderStrip::Fallback);
        assert!(stripped.pcm.is_empty());
    }

    #[test]
    fn test_duration_from_format() {
        let format = WavFormat::pcm16(16_000, 1);
        assert_eq!(format.byte_rate(), 32_000);
        assert_eq!(format.duration_ms(32_000), 1_000);
        assert_eq!(format.duration_ms(8_000), 250);
    }
}
