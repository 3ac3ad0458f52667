//! Audio format descriptors and sample conversion.
//!
//! - [`AudioFormat`]: the descriptor an external source advertises
//! - [`PcmLayout`]: the closed set of linear PCM layouts the mixer converts
//! - [`CanonicalFormat`]: the single signed little-endian format a read loop
//!   mixes in

mod convert;

pub(crate) use convert::{decode_into, encode_le};
pub use convert::rescale;

use std::fmt;

use crate::MixerError;

/// Encoding of an audio stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Uncompressed linear PCM.
    Linear,
    /// Any other (compressed) encoding, by name. Needs a transcoder.
    Other(String),
}

/// Whether samples are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Signedness {
    /// Two's complement samples.
    Signed,
    /// Offset-binary samples.
    Unsigned,
    /// Not advertised; treated as signed.
    #[default]
    Unspecified,
}

/// Byte order of multi-byte samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
    /// Not advertised; treated as little endian.
    #[default]
    Unspecified,
}

/// Format descriptor of an elementary audio stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Stream encoding.
    pub encoding: Encoding,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample.
    pub sample_size_bits: u16,
    /// Channel count.
    pub channels: u16,
    /// Sample signedness.
    pub signedness: Signedness,
    /// Sample byte order.
    pub endianness: Endianness,
}

impl AudioFormat {
    /// Creates a linear PCM format.
    pub fn linear(
        sample_rate: u32,
        sample_size_bits: u16,
        channels: u16,
        signedness: Signedness,
        endianness: Endianness,
    ) -> Self {
        Self {
            encoding: Encoding::Linear,
            sample_rate,
            sample_size_bits,
            channels,
            signedness,
            endianness,
        }
    }

    /// Signed little-endian linear PCM.
    pub fn pcm_le(sample_rate: u32, sample_size_bits: u16, channels: u16) -> Self {
        Self::linear(
            sample_rate,
            sample_size_bits,
            channels,
            Signedness::Signed,
            Endianness::Little,
        )
    }

    /// Creates a format with a non-linear encoding.
    pub fn encoded(name: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: Encoding::Other(name.into()),
            sample_rate,
            sample_size_bits: 0,
            channels,
            signedness: Signedness::Unspecified,
            endianness: Endianness::Unspecified,
        }
    }

    /// Returns `true` if both formats share an encoding.
    ///
    /// The mixer only asks a source to switch to the canonical format when
    /// the source already delivers the same encoding.
    pub fn matches(&self, other: &AudioFormat) -> bool {
        self.encoding == other.encoding
    }

    /// Returns `true` if this format can be chosen as the mixing format.
    pub(crate) fn is_canonical_candidate(&self) -> bool {
        self.encoding == Encoding::Linear
            && matches!(
                self.signedness,
                Signedness::Signed | Signedness::Unspecified
            )
            && matches!(
                self.endianness,
                Endianness::Little | Endianness::Unspecified
            )
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.encoding {
            Encoding::Linear => write!(f, "LINEAR")?,
            Encoding::Other(name) => write!(f, "{name}")?,
        }
        write!(
            f,
            ", {} Hz, {}-bit, {} ch, {:?}, {:?}",
            self.sample_rate,
            self.sample_size_bits,
            self.channels,
            self.signedness,
            self.endianness
        )
    }
}

/// Sample depth supported by the mixing arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleDepth {
    /// 8-bit samples.
    Bits8,
    /// 16-bit samples.
    Bits16,
    /// 32-bit samples.
    Bits32,
}

impl SampleDepth {
    /// Maps a bit count to a depth; 24-bit and anything else is unsupported.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            16 => Some(Self::Bits16),
            32 => Some(Self::Bits32),
            _ => None,
        }
    }

    /// Bits per sample.
    pub fn bits(self) -> u16 {
        match self {
            Self::Bits8 => 8,
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }

    /// Bytes per sample.
    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }

    /// Largest representable signed sample value.
    pub fn max_sample(self) -> i64 {
        match self {
            Self::Bits8 => i64::from(i8::MAX),
            Self::Bits16 => i64::from(i16::MAX),
            Self::Bits32 => i64::from(i32::MAX),
        }
    }

    /// Smallest representable signed sample value.
    pub fn min_sample(self) -> i64 {
        match self {
            Self::Bits8 => i64::from(i8::MIN),
            Self::Bits16 => i64::from(i16::MIN),
            Self::Bits32 => i64::from(i32::MIN),
        }
    }
}

/// A linear PCM layout the conversion table knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmLayout {
    /// Sample depth.
    pub depth: SampleDepth,
    /// Two's complement (`true`) or offset binary (`false`).
    pub signed: bool,
    /// Most significant byte first.
    pub big_endian: bool,
}

impl PcmLayout {
    /// Resolves the layout of a format, rejecting anything not in the table.
    ///
    /// # Errors
    ///
    /// Returns [`MixerError::UnsupportedFormat`] for non-linear encodings and
    /// bit depths other than 8, 16 and 32.
    pub fn of(format: &AudioFormat) -> Result<Self, MixerError> {
        if format.encoding != Encoding::Linear {
            return Err(MixerError::unsupported(format, "encoding"));
        }
        let depth = SampleDepth::from_bits(format.sample_size_bits)
            .ok_or_else(|| MixerError::unsupported(format, "sample size"))?;
        Ok(Self {
            depth,
            signed: format.signedness != Signedness::Unsigned,
            big_endian: depth != SampleDepth::Bits8 && format.endianness == Endianness::Big,
        })
    }
}

/// The signed little-endian PCM format every contribution is converted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Sample depth.
    pub depth: SampleDepth,
    /// Channel count.
    pub channels: u16,
}

impl CanonicalFormat {
    /// 8 kHz, 16-bit, mono.
    pub const DEFAULT: Self = Self {
        sample_rate: 8000,
        depth: SampleDepth::Bits16,
        channels: 1,
    };

    /// Creates a canonical format from its parts.
    pub fn new(sample_rate: u32, depth: SampleDepth, channels: u16) -> Self {
        Self {
            sample_rate,
            depth,
            channels,
        }
    }

    /// Returns the equivalent external descriptor.
    pub fn to_audio_format(&self) -> AudioFormat {
        AudioFormat::pcm_le(self.sample_rate, self.depth.bits(), self.channels)
    }
}

impl Default for CanonicalFormat {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<&AudioFormat> for CanonicalFormat {
    type Error = MixerError;

    /// Completes unspecified attributes and validates the depth.
    ///
    /// 24-bit PCM is rejected explicitly: the mixing arithmetic has no
    /// representation for it.
    fn try_from(format: &AudioFormat) -> Result<Self, Self::Error> {
        if !format.is_canonical_candidate() {
            return Err(MixerError::unsupported(format, "not signed little-endian PCM"));
        }
        let depth = SampleDepth::from_bits(format.sample_size_bits)
            .ok_or_else(|| MixerError::unsupported(format, "sample size"))?;
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(MixerError::unsupported(format, "rate or channels"));
        }
        Ok(Self::new(format.sample_rate, depth, format.channels))
    }
}

impl fmt::Display for CanonicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {}-bit, {} ch, signed LE",
            self.sample_rate,
            self.depth.bits(),
            self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ignores_everything_but_encoding() {
        let a = AudioFormat::pcm_le(8000, 16, 1);
        let b = AudioFormat::linear(48000, 8, 2, Signedness::Unsigned, Endianness::Big);
        assert!(a.matches(&b));
        assert!(!a.matches(&AudioFormat::encoded("opus", 48000, 1)));
    }

    #[test]
    fn test_layout_rejects_24_bit() {
        let fmt = AudioFormat::pcm_le(48000, 24, 1);
        assert!(matches!(
            PcmLayout::of(&fmt),
            Err(MixerError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_layout_unspecified_defaults() {
        let fmt = AudioFormat::linear(
            8000,
            16,
            1,
            Signedness::Unspecified,
            Endianness::Unspecified,
        );
        let layout = PcmLayout::of(&fmt).unwrap();
        assert!(layout.signed);
        assert!(!layout.big_endian);
    }

    #[test]
    fn test_canonical_rejects_big_endian_and_24_bit() {
        let be = AudioFormat::linear(8000, 16, 1, Signedness::Signed, Endianness::Big);
        assert!(CanonicalFormat::try_from(&be).is_err());

        let deep = AudioFormat::pcm_le(48000, 24, 2);
        assert!(CanonicalFormat::try_from(&deep).is_err());
    }

    #[test]
    fn test_canonical_from_unspecified() {
        let fmt = AudioFormat::linear(
            16000,
            16,
            1,
            Signedness::Unspecified,
            Endianness::Little,
        );
        let canonical = CanonicalFormat::try_from(&fmt).unwrap();
        assert_eq!(canonical, CanonicalFormat::new(16000, SampleDepth::Bits16, 1));
        assert_eq!(canonical.to_audio_format().signedness, Signedness::Signed);
    }

    #[test]
    fn test_depth_bounds() {
        assert_eq!(SampleDepth::Bits16.max_sample(), 32767);
        assert_eq!(SampleDepth::Bits8.min_sample(), -128);
        assert_eq!(SampleDepth::Bits32.bytes(), 4);
    }
}
