//! # conference-mixer
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time multi-source audio mixing with per-listener output mixes.
//!
//! `conference-mixer` ingests a changing set of live audio streams, converts
//! them to one canonical PCM format, sums them sample-accurately and
//! republishes any number of independent mixes. Each mix can leave out one
//! contributor (so nobody hears their own echo), substitute silence for the
//! local microphone, or inject DTMF tones in its place.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use conference_mixer::{AudioFormat, AudioMixer, DtmfTone, MockSource};
//!
//! let mic = Arc::new(MockSource::new("mic", AudioFormat::pcm_le(8000, 16, 1)));
//! let alice = Arc::new(MockSource::new("alice", AudioFormat::pcm_le(8000, 16, 1)));
//!
//! let mixer = AudioMixer::builder()
//!     .capture_source(mic.clone())
//!     .on_event(|e| tracing::warn!(?e, "mixer event"))
//!     .build();
//!
//! // What Alice hears: everyone but Alice.
//! let to_alice = mixer.create_output_mix();
//! mixer.add_input_source(alice.clone(), Some(&to_alice)).unwrap();
//!
//! to_alice.connect();
//! to_alice.start().unwrap();
//! to_alice.add_dtmf(DtmfTone::Digit5);
//!
//! // The microphone's frame is replaced by the tone in Alice's mix.
//! mic.push_samples(&[0; 160]);
//! let chunk = to_alice.read_chunk().unwrap();
//! assert_eq!(chunk.samples.len(), DtmfTone::frame_count(8000));
//! ```
//!
//! ## Architecture
//!
//! - **Sources** notify readiness from their own threads; the read cycle runs
//!   synchronously in that call and never blocks on consumers
//! - **Read Loop** builds one zero-padded sample set per cycle from pooled buffers
//! - **Output Mixes** apply exclusion, mute and DTMF rules and sum eagerly
//! - **Sessions** hand each mixed frame to a tokio router that fans out to sinks
//!
//! A slow sink only ever costs dropped chunks in its own session, never a
//! stalled cycle for the other listeners. A failed buffer allocation is the
//! exception: it fails every output mix of the cycle and ends their sessions.

// unsafe_code lint is configured in Cargo.toml as "deny"
#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod chunk;
mod config;
mod dtmf;
mod error;
mod event;
pub mod format;
mod mixer;
pub mod output;
mod pipeline;
mod pool;
mod session;
mod sink;
pub mod source;

pub use builder::AudioMixerBuilder;
pub use chunk::AudioChunk;
pub use config::{CycleTrigger, MixerConfig, SessionConfig};
pub use dtmf::DtmfTone;
pub use error::{MixerError, SinkError, SourceError};
pub use event::{event_callback, EventCallback, MixerEvent};
pub use format::{AudioFormat, CanonicalFormat, Encoding, Endianness, PcmLayout, SampleDepth, Signedness};
pub use mixer::AudioMixer;
pub use output::{mix, mix_into, mix_pair, OutputMix, OutputMixId};
pub use pipeline::LoopId;
pub use pool::{PoolStats, SampleBufferPool};
pub use session::{MixSession, SessionStats};
pub use sink::{ChannelSink, Sink};
pub use source::{
    BufferFlags, InputSource, MediaBuffer, MockSource, PushStream, SourceId, Transcoder,
    TranscoderFactory, TransferHandler,
};
