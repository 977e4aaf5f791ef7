//! The two-channel software mixer. Levels run 0-255 per channel and scale
//! 16-bit samples in place on the way to the sink; other sample widths pass
//! through untouched.

use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::config::SampleFormat;

pub struct Mixer {
    left: u8,
    right: u8,
}

impl Default for Mixer {
    fn default() -> Self {
        Mixer {
            left: 255,
            right: 255,
        }
    }
}

impl Mixer {
    pub fn get(&self) -> (u8, u8) {
        (self.left, self.right)
    }

    pub fn set(&mut self, left: u8, right: u8) {
        self.left = left;
        self.right = right;
    }

    /// Apply one channel spec: an absolute level or a `+N`/`-N` delta,
    /// clamped to 0..=255 either way.
    pub fn adjust(current: u8, spec: &str) -> Result<u8> {
        let bad = || eyre!("bad volume {spec:?}");
        if let Some(delta) = spec.strip_prefix('+') {
            let delta: u16 = delta.parse().map_err(|_| bad())?;
            Ok(u8::try_from((u16::from(current) + delta).min(255)).expect("clamped"))
        } else if let Some(delta) = spec.strip_prefix('-') {
            let delta: u16 = delta.parse().map_err(|_| bad())?;
            Ok(u8::try_from(u16::from(current).saturating_sub(delta)).expect("clamped"))
        } else {
            let level: u16 = spec.parse().map_err(|_| bad())?;
            if level > 255 {
                return Err(bad());
            }
            Ok(level as u8)
        }
    }

    /// Scale a chunk of interleaved PCM in place.
    pub fn apply(&self, pcm: &mut [u8], format: SampleFormat) {
        if format.bits != 16 || (self.left == 255 && self.right == 255) {
            return;
        }
        let gains = [i32::from(self.left), i32::from(self.right)];
        for (i, frame) in pcm.chunks_exact_mut(2).enumerate() {
            let gain = if format.channels == 2 {
                gains[i % 2]
            } else {
                (gains[0] + gains[1]) / 2
            };
            let sample = i16::from_le_bytes([frame[0], frame[1]]);
            let scaled = (i32::from(sample) * gain / 255) as i16;
            frame.copy_from_slice(&scaled.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_clamps_both_ways() {
        assert_eq!(Mixer::adjust(100, "+200").unwrap(), 255);
        assert_eq!(Mixer::adjust(100, "-200").unwrap(), 0);
        assert_eq!(Mixer::adjust(100, "+5").unwrap(), 105);
        assert_eq!(Mixer::adjust(100, "-5").unwrap(), 95);
        assert_eq!(Mixer::adjust(100, "0").unwrap(), 0);
        assert_eq!(Mixer::adjust(100, "255").unwrap(), 255);
        assert!(Mixer::adjust(100, "256").is_err());
        assert!(Mixer::adjust(100, "loud").is_err());
    }

    #[test]
    fn scaling_halves_samples() {
        let mut mixer = Mixer::default();
        mixer.set(127, 255);
        // one stereo frame, both channels at 0x0100
        let mut pcm = [0x00, 0x01, 0x00, 0x01];
        mixer.apply(&mut pcm, SampleFormat::default());
        let left = i16::from_le_bytes([pcm[0], pcm[1]]);
        let right = i16::from_le_bytes([pcm[2], pcm[3]]);
        assert_eq!(left, 0x0100 * 127 / 255);
        assert_eq!(right, 0x0100);
    }

    #[test]
    fn full_volume_is_a_no_op() {
        let mixer = Mixer::default();
        let mut pcm = [0x34, 0x12, 0xcd, 0xab];
        let orig = pcm;
        mixer.apply(&mut pcm, SampleFormat::default());
        assert_eq!(pcm, orig);
    }
}
