//! Audio pipeline components.
//!
//! The pipeline moves audio from registered sources to output mixes and on
//! to sinks:
//!
//! ```text
//! Sources → Read Loop → Output Mixes → (Session channel) → Router Task → Sinks
//! ```
//!
//! - **Registry**: Owns every source's connect/start lifecycle and transcoder
//! - **Read Loop**: Push-driven cycle building one sample set per notification
//! - **Router**: Per-session task handing a listener's frames and quiet
//!   periods to its sinks
//!
//! The read cycle runs in the producer's thread and never blocks on sinks.

mod read_loop;
mod registry;
mod router;
mod sample_set;

pub use read_loop::LoopId;
pub(crate) use read_loop::{ReadLoop, StreamSlot};
pub(crate) use registry::{needs_transcoder, CancelToken, Link, PendingConnect, Registry, SourceEntry};
pub(crate) use router::{Delivery, Router, RouterCommand};
pub(crate) use sample_set::SampleSet;
#[cfg(test)]
pub(crate) use sample_set::SampleEntry;
