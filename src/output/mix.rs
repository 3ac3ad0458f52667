//! Non-clipping N-way summation.
//!
//! Two contributions combine as `a + b - round(a * b / max)`, where `max` is
//! the largest value of the canonical depth. More contributions fold in one
//! at a time. The running value is kept unclamped and only the final result
//! is clamped to the representable range.

use crate::format::SampleDepth;

/// Combines two samples with the non-clipping formula.
#[inline]
pub fn mix_pair(a: f64, b: f64, max: f64) -> f64 {
    a + b - (a * b / max).round()
}

/// Mixes `inputs` into `out`, producing exactly `len` samples.
///
/// Inputs shorter than `len` count as silent for the remainder. `acc` is
/// scratch space reused across calls. Returns the number of inputs mixed;
/// with a single input the output equals it exactly.
pub fn mix_into<'a, I>(inputs: I, len: usize, depth: SampleDepth, acc: &mut Vec<f64>, out: &mut Vec<i32>) -> usize
where
    I: IntoIterator<Item = &'a [i32]>,
{
    let max = depth.max_sample() as f64;
    let min = depth.min_sample() as f64;

    acc.clear();
    acc.resize(len, 0.0);
    let mut count = 0;
    for input in inputs {
        count += 1;
        for (running, &sample) in acc.iter_mut().zip(input) {
            *running = mix_pair(*running, f64::from(sample), max);
        }
    }

    out.clear();
    if count > 0 {
        out.extend(acc.iter().map(|&v| v.clamp(min, max) as i32));
    }
    count
}

/// Mixes equal or unequal length inputs into a new buffer as long as the
/// longest input.
///
/// # Example
///
/// ```
/// use conference_mixer::{mix, SampleDepth};
///
/// let a: &[i32] = &[100, 100];
/// let b: &[i32] = &[50, 50];
/// let out = mix(&[a, b], SampleDepth::Bits16);
/// assert_eq!(out, vec![150, 150]);
/// ```
pub fn mix(inputs: &[&[i32]], depth: SampleDepth) -> Vec<i32> {
    let len = inputs.iter().map(|i| i.len()).max().unwrap_or(0);
    let mut acc = Vec::new();
    let mut out = Vec::new();
    mix_into(inputs.iter().copied(), len, depth, &mut acc, &mut out);
    out
}
