//! Sample conversion table.
//!
//! Every supported [`PcmLayout`] decodes to signed samples at the canonical
//! depth, held in `i32` so that 8, 16 and 32-bit canonical formats share one
//! sample array type.

use super::{PcmLayout, SampleDepth};

/// Rescales a signed sample from one depth to another.
///
/// Widening shifts left (8-bit `1` becomes 16-bit `256`), narrowing shifts
/// right and keeps the sign.
#[inline]
pub fn rescale(sample: i32, from: SampleDepth, to: SampleDepth) -> i32 {
    let from_bits = u32::from(from.bits());
    let to_bits = u32::from(to.bits());
    if to_bits >= from_bits {
        sample << (to_bits - from_bits)
    } else {
        sample >> (from_bits - to_bits)
    }
}

/// Decodes one raw sample into a signed value at its own depth.
#[inline]
fn decode_sample(layout: PcmLayout, raw: &[u8]) -> i32 {
    match layout.depth {
        SampleDepth::Bits8 => {
            let byte = raw[0];
            if layout.signed {
                i32::from(byte as i8)
            } else {
                i32::from(byte) - 128
            }
        }
        SampleDepth::Bits16 => {
            let bytes = [raw[0], raw[1]];
            let value = if layout.big_endian {
                u16::from_be_bytes(bytes)
            } else {
                u16::from_le_bytes(bytes)
            };
            if layout.signed {
                i32::from(value as i16)
            } else {
                i32::from(value) - 32768
            }
        }
        SampleDepth::Bits32 => {
            let bytes = [raw[0], raw[1], raw[2], raw[3]];
            let value = if layout.big_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            };
            if layout.signed {
                value as i32
            } else {
                (value ^ 0x8000_0000) as i32
            }
        }
    }
}

/// Decodes `input` into `out`, converting to `target` depth.
///
/// Decodes `min(out.len(), input.len() / bytes_per_sample)` samples and
/// returns that count. A trailing partial sample is ignored.
pub(crate) fn decode_into(
    layout: PcmLayout,
    input: &[u8],
    target: SampleDepth,
    out: &mut [i32],
) -> usize {
    let width = layout.depth.bytes();
    let mut count = 0;
    for (slot, raw) in out.iter_mut().zip(input.chunks_exact(width)) {
        *slot = rescale(decode_sample(layout, raw), layout.depth, target);
        count += 1;
    }
    count
}

/// Encodes canonical samples as signed little-endian bytes, replacing `out`.
pub(crate) fn encode_le(samples: &[i32], depth: SampleDepth, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * depth.bytes());
    for &sample in samples {
        match depth {
            SampleDepth::Bits8 => out.push(sample as i8 as u8),
            SampleDepth::Bits16 => out.extend_from_slice(&(sample as i16).to_le_bytes()),
            SampleDepth::Bits32 => out.extend_from_slice(&sample.to_le_bytes()),
        }
    }
}
