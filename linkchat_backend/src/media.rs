//! Inline media encoding for multi-modal messages.
//!
//! - images become `data:` URLs
//! - audio becomes raw base64 plus a format tag; `m4a` is first transcoded
//!   to 16-bit PCM WAV because chat endpoints only accept `wav`/`mp3`

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Bytes per base64 chunk. Must stay a multiple of 3 so chunks concatenate cleanly.
const ENCODE_CHUNK_BYTES: usize = 3 * 0x8000;

const WAV_HEADER_BYTES: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

pub fn media_kind_for_extension(extension: &str) -> Option<MediaKind> {
    match extension.to_ascii_lowercase().as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(MediaKind::Image),
        "mp3" | "wav" | "m4a" => Some(MediaKind::Audio),
        _ => None,
    }
}

pub fn mime_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// Base64-encode `bytes` in bounded chunks.
pub fn encode_base64_chunked(bytes: &[u8]) -> String {
    let engine = &base64::engine::general_purpose::STANDARD;
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(ENCODE_CHUNK_BYTES) {
        engine.encode_string(chunk, &mut out);
    }
    out
}

pub fn encode_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, encode_base64_chunked(bytes))
}

/// PCM audio, one sample vector per channel, samples nominally in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

fn to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Write `audio` as a 16-bit PCM RIFF/WAVE file.
pub fn encode_wav(audio: &DecodedAudio) -> Result<Vec<u8>> {
    let channel_count = audio.channels.len();
    if channel_count == 0 {
        anyhow::bail!("Cannot encode WAV without any channels");
    }
    if audio.sample_rate == 0 {
        anyhow::bail!("Cannot encode WAV with a zero sample rate");
    }
    let frames = audio.channels[0].len();
    if audio.channels.iter().any(|channel| channel.len() != frames) {
        anyhow::bail!("WAV channels have mismatched lengths");
    }

    let channels = u16::try_from(channel_count).context("Too many audio channels")?;
    let block_align = channels
        .checked_mul(2)
        .context("Too many audio channels")?;
    let data_len = frames
        .checked_mul(usize::from(block_align))
        .context("Audio too long for WAV")?;
    let data_len_u32 = u32::try_from(data_len)
        .ok()
        .filter(|len| len.checked_add(36).is_some())
        .context("Audio too long for WAV")?;
    let byte_rate = audio
        .sample_rate
        .checked_mul(u32::from(block_align))
        .with_context(|| format!("Sample rate {} too high for WAV", audio.sample_rate))?;

    let mut out = Vec::with_capacity(WAV_HEADER_BYTES + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len_u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&audio.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len_u32.to_le_bytes());

    for frame in 0..frames {
        for channel in &audio.channels {
            out.extend_from_slice(&to_pcm16(channel[frame]).to_le_bytes());
        }
    }

    Ok(out)
}

/// Decodes a compressed audio container into PCM.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio>;
}

/// Decodes through the `ffmpeg` binary, resampling to a fixed layout.
pub struct FfmpegAudioDecoder {
    pub sample_rate: u32,
    pub channels: u16,
}

impl FfmpegAudioDecoder {
    pub fn new() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

impl Default for FfmpegAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioDecoder for FfmpegAudioDecoder {
    async fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio> {
        let sample_rate = self.sample_rate.to_string();
        let channels = self.channels.to_string();
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "f32le",
            "-ac",
            channels.as_str(),
            "-ar",
            sample_rate.as_str(),
            "pipe:1",
        ];

        let mut child = Command::new("ffmpeg")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start ffmpeg for audio decoding")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin unavailable"))?;
        let input = bytes.to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for ffmpeg")?;
        if let Ok(Err(e)) = writer.await {
            tracing::debug!("ffmpeg stdin closed early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffmpeg audio decode failed (status {}): {}",
                output.status,
                stderr.trim()
            );
        }

        deinterleave_f32le(&output.stdout, self.sample_rate, usize::from(self.channels))
    }
}

fn deinterleave_f32le(raw: &[u8], sample_rate: u32, channel_count: usize) -> Result<DecodedAudio> {
    if channel_count == 0 {
        anyhow::bail!("Decoder produced zero channels");
    }
    let frame_bytes = channel_count * 4;
    if raw.len() % frame_bytes != 0 {
        anyhow::bail!("Decoded PCM stream ends mid-frame ({} bytes)", raw.len());
    }

    let frames = raw.len() / frame_bytes;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in raw.chunks_exact(frame_bytes) {
        for (index, sample) in frame.chunks_exact(4).enumerate() {
            let sample = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
            channels[index].push(sample);
        }
    }

    Ok(DecodedAudio {
        sample_rate,
        channels,
    })
}

/// Transcode an `m4a` file to WAV.
pub async fn m4a_to_wav(decoder: &dyn AudioDecoder, bytes: &[u8]) -> Result<Vec<u8>> {
    let audio = decoder
        .decode(bytes)
        .await
        .context("Failed to decode m4a audio")?;
    encode_wav(&audio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_base64_matches_single_pass() {
        let bytes: Vec<u8> = (0..(ENCODE_CHUNK_BYTES * 2 + 7))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert_eq!(encode_base64_chunked(&bytes), expected);
    }

    #[test]
    fn data_url_has_mime_prefix() {
        let url = encode_data_url(b"abc", "image/png");
        assert_eq!(url, "data:image/png;base64,YWJj");
    }

    #[test]
    fn extension_tables() {
        assert_eq!(media_kind_for_extension("PNG"), Some(MediaKind::Image));
        assert_eq!(media_kind_for_extension("m4a"), Some(MediaKind::Audio));
        assert_eq!(media_kind_for_extension("md"), None);
        assert_eq!(media_kind_for_extension("bmp"), None);
        assert_eq!(mime_type_for_extension("jpeg"), "image/jpeg");
        assert_eq!(mime_type_for_extension("mp3"), "audio/mpeg");
    }

    #[test]
    fn wav_header_and_interleaving() {
        let audio = DecodedAudio {
            sample_rate: 8_000,
            channels: vec![vec![0.0, 1.0], vec![-1.0, 0.5]],
        };
        let wav = encode_wav(&audio).unwrap();

        assert_eq!(wav.len(), WAV_HEADER_BYTES + 8);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36 + 8);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([wav[20], wav[21]]), 1);
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 2);
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 8_000);
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 32_000);
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 4);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 16);
        assert_eq!(&wav[36..40], b"data");

        let samples: Vec<i16> = wav[44..]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![0, -32768, 32767, 16383]);
    }

    #[test]
    fn samples_are_clamped() {
        assert_eq!(to_pcm16(3.0), i16::MAX);
        assert_eq!(to_pcm16(-3.0), i16::MIN);
        assert_eq!(to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn wav_rejects_overflowing_byte_rate() {
        let audio = DecodedAudio {
            sample_rate: u32::MAX / 2,
            channels: vec![vec![0.0], vec![0.0]],
        };
        let err = encode_wav(&audio).unwrap_err();
        assert!(err.to_string().contains("too high"));
    }

    #[test]
    fn wav_rejects_ragged_channels() {
        let audio = DecodedAudio {
            sample_rate: 44_100,
            channels: vec![vec![0.0], vec![]],
        };
        assert!(encode_wav(&audio).is_err());
    }

    #[test]
    fn deinterleaves_pcm_frames() {
        let mut raw = Vec::new();
        for sample in [0.25f32, -0.25, 0.5, -0.5] {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        let audio = deinterleave_f32le(&raw, 44_100, 2).unwrap();
        assert_eq!(audio.channels, vec![vec![0.25, 0.5], vec![-0.25, -0.5]]);

        assert!(deinterleave_f32le(&raw[..6], 44_100, 2).is_err());
    }

    struct ToneDecoder;

    #[async_trait]
    impl AudioDecoder for ToneDecoder {
        async fn decode(&self, _bytes: &[u8]) -> Result<DecodedAudio> {
            Ok(DecodedAudio {
                sample_rate: 16_000,
                channels: vec![vec![0.0; 4]],
            })
        }
    }

    #[tokio::test]
    async fn m4a_transcode_produces_wav() {
        let wav = m4a_to_wav(&ToneDecoder, b"fake m4a").await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), WAV_HEADER_BYTES + 8);
    }
}
