//! Property-based tests for the mixing formula and depth conversion.
//!
//! These tests use proptest to verify invariants across many random inputs.

use std::sync::Arc;

use conference_mixer::format::rescale;
use conference_mixer::{
    mix, AudioFormat, AudioMixer, CycleTrigger, MixerConfig, MockSource, SampleDepth,
};
use proptest::prelude::*;

// Helper: 16-bit sample values
fn samples16(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(i32::from(i16::MIN)..=i32::from(i16::MAX), len)
}

// Helper: 8-bit sample values
fn samples8(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(i32::from(i8::MIN)..=i32::from(i8::MAX), len)
}

proptest! {
    /// Property: a single contributor is passed through unchanged
    #[test]
    fn single_input_is_identity(samples in samples16(0..512)) {
        prop_assert_eq!(mix(&[samples.as_slice()], SampleDepth::Bits16), samples);
    }

    /// Property: 16-bit mixes never leave the representable range
    #[test]
    fn mix_stays_in_range_16(inputs in prop::collection::vec(samples16(1..128), 1..8)) {
        let refs: Vec<&[i32]> = inputs.iter().map(Vec::as_slice).collect();
        let out = mix(&refs, SampleDepth::Bits16);
        prop_assert!(out.iter().all(|&s| (i32::from(i16::MIN)..=i32::from(i16::MAX)).contains(&s)));
    }

    /// Property: 8-bit mixes never leave the representable range
    #[test]
    fn mix_stays_in_range_8(inputs in prop::collection::vec(samples8(1..128), 1..8)) {
        let refs: Vec<&[i32]> = inputs.iter().map(Vec::as_slice).collect();
        let out = mix(&refs, SampleDepth::Bits8);
        prop_assert!(out.iter().all(|&s| (i32::from(i8::MIN)..=i32::from(i8::MAX)).contains(&s)));
    }

    /// Property: the order of two contributors does not matter
    #[test]
    fn two_inputs_are_symmetric(a in samples16(0..256), b in samples16(0..256)) {
        prop_assert_eq!(
            mix(&[a.as_slice(), b.as_slice()], SampleDepth::Bits16),
            mix(&[b.as_slice(), a.as_slice()], SampleDepth::Bits16)
        );
    }

    /// Property: mixing in silence changes nothing
    #[test]
    fn silence_is_neutral(a in samples16(1..256)) {
        let zeros = vec![0; a.len()];
        prop_assert_eq!(mix(&[a.as_slice(), zeros.as_slice()], SampleDepth::Bits16), a.clone());
        prop_assert_eq!(mix(&[zeros.as_slice(), a.as_slice()], SampleDepth::Bits16), a);
    }

    /// Property: the mix is as long as the longest contributor
    #[test]
    fn output_length_is_longest_input(inputs in prop::collection::vec(samples16(0..200), 1..6)) {
        let refs: Vec<&[i32]> = inputs.iter().map(Vec::as_slice).collect();
        let longest = inputs.iter().map(Vec::len).max().unwrap_or(0);
        prop_assert_eq!(mix(&refs, SampleDepth::Bits16).len(), longest);
    }

    /// Property: widening multiplies by two per added bit and narrowing undoes it
    #[test]
    fn rescale_widening_is_exact(sample in i32::from(i8::MIN)..=i32::from(i8::MAX)) {
        let wide = rescale(sample, SampleDepth::Bits8, SampleDepth::Bits16);
        prop_assert_eq!(wide, sample * 256);
        prop_assert_eq!(rescale(wide, SampleDepth::Bits16, SampleDepth::Bits8), sample);

        let wider = rescale(wide, SampleDepth::Bits16, SampleDepth::Bits32);
        prop_assert_eq!(wider, sample * (1 << 24));
    }

    /// Property: a mixer cycle produces what the formula produces, and a
    /// listener's own stream never reaches it
    #[test]
    fn mixer_cycle_matches_formula(
        (a, b) in (1usize..160).prop_flat_map(|len| (samples16(len..len + 1), samples16(len..len + 1)))
    ) {
        let mixer = AudioMixer::builder()
            .with_config(MixerConfig {
                trigger: CycleTrigger::PrimaryStream,
                ..Default::default()
            })
            .build();
        let first = Arc::new(MockSource::new("first", AudioFormat::pcm_le(8000, 16, 1)));
        let second = Arc::new(MockSource::new("second", AudioFormat::pcm_le(8000, 16, 1)));
        let everyone = mixer.create_output_mix();
        let to_second = mixer.create_output_mix();
        mixer.add_input_source(first.clone(), None).unwrap();
        mixer.add_input_source(second.clone(), Some(&to_second)).unwrap();
        for output in [&everyone, &to_second] {
            output.connect();
            output.start().unwrap();
        }

        second.push_samples(&b);
        first.push_samples(&a);

        let expected = mix(&[a.as_slice(), b.as_slice()], SampleDepth::Bits16);
        let everyone_chunk = everyone.read_chunk().unwrap();
        prop_assert_eq!(everyone_chunk.samples.as_slice(), expected.as_slice());
        let to_second_chunk = to_second.read_chunk().unwrap();
        prop_assert_eq!(to_second_chunk.samples.as_slice(), a.as_slice());
    }
}
