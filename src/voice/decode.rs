//! Decoding synthesis payloads into f32 samples

use std::io::Cursor;

use serde::Deserialize;

use super::frame::pcm16_le_to_f32;
use crate::{Error, Result};

/// Encoding of audio payloads returned by the synthesis service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Raw little-endian signed 16-bit mono PCM
    #[default]
    PcmS16le,
    /// MPEG layer III frames
    Mp3,
}

impl AudioEncoding {
    /// Wire name sent to the synthesis service
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PcmS16le => "pcm_s16le",
            Self::Mp3 => "mp3",
        }
    }
}

impl std::str::FromStr for AudioEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcm_s16le" | "pcm" => Ok(Self::PcmS16le),
            "mp3" => Ok(Self::Mp3),
            other => Err(Error::Config(format!("unknown audio encoding: {other}"))),
        }
    }
}

/// Decode a payload into mono f32 samples
///
/// # Errors
///
/// Returns error if the payload is not valid for `encoding`
pub fn decode(payload: &[u8], encoding: AudioEncoding) -> Result<Vec<f32>> {
    match encoding {
        AudioEncoding::PcmS16le => {
            if payload.len() % 2 != 0 {
                return Err(Error::Protocol(format!(
                    "pcm payload has odd length {}",
                    payload.len()
                )));
            }
            Ok(pcm16_le_to_f32(payload))
        }
        AudioEncoding::Mp3 => decode_mp3(payload),
    }
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_payload_decodes() {
        let samples = decode(&[0x00, 0x40, 0x00, 0xC0], AudioEncoding::PcmS16le).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 1e-6);
        assert!((samples[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn odd_pcm_payload_is_protocol_error() {
        let err = decode(&[0x00, 0x40, 0x00], AudioEncoding::PcmS16le).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn empty_mp3_yields_no_samples() {
        let samples = decode(&[], AudioEncoding::Mp3).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn encoding_parses_from_config_strings() {
        assert_eq!("mp3".parse::<AudioEncoding>().unwrap(), AudioEncoding::Mp3);
        assert_eq!("PCM".parse::<AudioEncoding>().unwrap(), AudioEncoding::PcmS16le);
        assert!("ogg".parse::<AudioEncoding>().is_err());
    }
}
