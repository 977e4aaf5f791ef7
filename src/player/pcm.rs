//! The decoder contract: stdout starts with a fixed 16-byte header
//! describing the PCM that follows. Four native-order u32s: sample rate,
//! bits per sample, channel count, and a nonzero flag for little-endian
//! sample data.

use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::config::SampleFormat;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub rate: u32,
    pub bits: u32,
    pub channels: u32,
    pub little_endian: bool,
}

impl StreamHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<StreamHeader> {
        let word = |i: usize| {
            u32::from_ne_bytes(raw[i * 4..i * 4 + 4].try_into().expect("4 bytes"))
        };
        let header = StreamHeader {
            rate: word(0),
            bits: word(1),
            channels: word(2),
            little_endian: word(3) != 0,
        };
        if header.rate == 0 || header.channels == 0 || !matches!(header.bits, 8 | 16 | 24 | 32) {
            return Err(eyre!("implausible stream header {header:?}"));
        }
        Ok(header)
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        for (i, v) in [
            self.rate,
            self.bits,
            self.channels,
            u32::from(self.little_endian),
        ]
        .into_iter()
        .enumerate()
        {
            raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        raw
    }

    pub fn matches(self, format: SampleFormat) -> bool {
        self.rate == format.rate && self.bits == format.bits && self.channels == format.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = StreamHeader {
            rate: 44100,
            bits: 16,
            channels: 2,
            little_endian: cfg!(target_endian = "little"),
        };
        assert_eq!(StreamHeader::parse(&h.to_bytes()).unwrap(), h);
        assert!(h.matches(SampleFormat::default()));
    }

    #[test]
    fn nonsense_is_rejected() {
        assert!(StreamHeader::parse(&[0u8; HEADER_LEN]).is_err());
        let bad = StreamHeader {
            rate: 44100,
            bits: 13,
            channels: 2,
            little_endian: true,
        };
        assert!(StreamHeader::parse(&bad.to_bytes()).is_err());
    }
}
