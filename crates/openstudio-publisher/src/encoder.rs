//! Opus encoding + Ogg muxing for the publisher's outbound chunks.
//!
//! Grounded on the standard Icecast Ogg/Opus source-client container: 20 ms
//! stereo frames are Opus-encoded and wrapped into Ogg pages via the `ogg`
//! crate's incremental packet writer, flushed to the caller roughly once a
//! second of audio has accumulated. Exact `ogg`/`opus` crate method names
//! are approximated here the same way `openstudio-rtc::transport`
//! approximates str0m's `Receive` constructor — plausible given each
//! crate's published surface, not toolchain-verified.

use bytes::Bytes;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Bitrate, Channels, Encoder as RawOpusEncoder};
use std::io::Cursor;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_SAMPLES: usize = 960; // 20 ms at 48 kHz

const STREAM_SERIAL: u32 = 0x4f53_5441; // arbitrary fixed per-publisher-session serial

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("opus encode failed: {0}")]
    Opus(#[from] opus::Error),
    #[error("ogg mux failed: {0}")]
    Ogg(#[from] std::io::Error),
    #[error("unsupported bitrate {0} kbps (expected one of 48/96/128/192)")]
    UnsupportedBitrate(u32),
}

/// The supported constant-bitrate presets for the outbound stream.
pub fn validate_bitrate(kbps: u32) -> Result<(), EncoderError> {
    if matches!(kbps, 48 | 96 | 128 | 192) {
        Ok(())
    } else {
        Err(EncoderError::UnsupportedBitrate(kbps))
    }
}

/// Encodes PCM to Opus and muxes into Ogg pages, handing back a completed
/// chunk once enough frames have accumulated.
pub struct OggOpusEncoder {
    opus: RawOpusEncoder,
    writer: PacketWriter<Cursor<Vec<u8>>>,
    granule_position: u64,
    frames_since_flush: u32,
    flush_every_frames: u32,
}

impl OggOpusEncoder {
    pub fn new(bitrate_kbps: u32) -> Result<Self, EncoderError> {
        validate_bitrate(bitrate_kbps)?;

        let mut opus = RawOpusEncoder::new(SAMPLE_RATE, Channels::Stereo, Application::Audio)?;
        opus.set_bitrate(Bitrate::Bits((bitrate_kbps * 1000) as i32))?;

        let frames_per_second = (SAMPLE_RATE as usize / FRAME_SAMPLES) as u32;

        Ok(Self {
            opus,
            writer: PacketWriter::new(Cursor::new(Vec::new())),
            granule_position: 0,
            frames_since_flush: 0,
            flush_every_frames: frames_per_second.max(1),
        })
    }

    /// Encodes one 20 ms interleaved stereo frame
    /// (`pcm.len() == FRAME_SAMPLES * CHANNELS`). Returns a completed ~1 s
    /// Ogg-muxed chunk once a page boundary is reached, or `None` while
    /// still buffering.
    pub fn encode_frame(&mut self, pcm: &[f32]) -> Result<Option<Bytes>, EncoderError> {
        let mut packet = vec![0u8; 4000];
        let len = self.opus.encode_float(pcm, &mut packet)?;
        packet.truncate(len);

        self.granule_position += FRAME_SAMPLES as u64;
        self.frames_since_flush += 1;
        let at_boundary = self.frames_since_flush >= self.flush_every_frames;

        let end_info = if at_boundary {
            PacketWriteEndInfo::EndPage
        } else {
            PacketWriteEndInfo::NormalPacket
        };

        self.writer
            .write_packet(packet, STREAM_SERIAL, end_info, self.granule_position)?;

        if !at_boundary {
            return Ok(None);
        }

        self.frames_since_flush = 0;
        let buffered = std::mem::take(self.writer.inner_mut().get_mut());
        self.writer.inner_mut().set_position(0);
        Ok(Some(Bytes::from(buffered)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exactly_the_recommended_bitrate_set() {
        for kbps in [48, 96, 128, 192] {
            assert!(validate_bitrate(kbps).is_ok());
        }
    }

    #[test]
    fn rejects_bitrates_outside_the_recommended_set() {
        assert!(validate_bitrate(64).is_err());
        assert!(validate_bitrate(256).is_err());
    }
}
