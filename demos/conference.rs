//! Three-party conference example.
//!
//! A local microphone and two remote peers are simulated with `MockSource`.
//! Each peer gets a mix of everyone but themselves, and the local speaker
//! gets the local playback mix. Halfway through, a DTMF digit is sent to
//! Alice in place of the microphone.
//!
//! Run with: cargo run --example conference

use std::sync::Arc;
use std::time::Duration;

use conference_mixer::{
    AudioChunk, AudioFormat, AudioMixer, ChannelSink, DtmfTone, MixSession, MixerEvent,
    MockSource, SessionConfig,
};
use tokio::sync::mpsc;

const RATE: u32 = 8000;
const FRAME: usize = 160;
const FRAMES: usize = 50;

/// A square wave at `period` samples, so each voice is easy to tell apart.
fn voice(period: usize, amplitude: i32, offset: usize) -> Vec<i32> {
    (0..FRAME)
        .map(|i| if ((i + offset) / period) % 2 == 0 { amplitude } else { -amplitude })
        .collect()
}

fn count_chunks(mut rx: mpsc::Receiver<AudioChunk>) -> tokio::task::JoinHandle<(usize, usize)> {
    tokio::spawn(async move {
        let (mut chunks, mut samples) = (0, 0);
        while let Some(chunk) = rx.recv().await {
            chunks += 1;
            samples += chunk.samples.len();
        }
        (chunks, samples)
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conference_mixer=info".into()),
        )
        .init();

    let format = AudioFormat::pcm_le(RATE, 16, 1);
    let mic = Arc::new(MockSource::new("microphone", format.clone()));
    let alice = Arc::new(MockSource::new("alice", format.clone()));
    let bob = Arc::new(MockSource::new("bob", format));

    let mixer = AudioMixer::builder()
        .capture_source(mic.clone())
        .on_event(|event| match event {
            MixerEvent::FormatNegotiated { format } => println!("Negotiated {format}"),
            MixerEvent::SourceDropped { source_id, reason } => {
                eprintln!("Source {source_id} dropped: {reason}");
            }
            MixerEvent::ChunkDropped { output } => eprintln!("{output} fell behind"),
            MixerEvent::SinkError { output, sink_name, error } => {
                eprintln!("Sink '{sink_name}' error for {output}: {error}");
            }
            MixerEvent::FrameAbandoned { output, sink_name } => {
                eprintln!("Sink '{sink_name}' missed a frame for {output}");
            }
            _ => {}
        })
        .build();

    let to_alice = mixer.create_output_mix();
    let to_bob = mixer.create_output_mix();
    mixer.add_input_source(alice.clone(), Some(&to_alice))?;
    mixer.add_input_source(bob.clone(), Some(&to_bob))?;
    let speaker = mixer.local_output_mix().ok_or("no capture source")?;

    let (alice_tx, alice_rx) = mpsc::channel(FRAMES * 4);
    let (bob_tx, bob_rx) = mpsc::channel(FRAMES * 4);
    let (speaker_tx, speaker_rx) = mpsc::channel(FRAMES * 4);
    let counters = [
        ("alice", count_chunks(alice_rx)),
        ("bob", count_chunks(bob_rx)),
        ("speaker", count_chunks(speaker_rx)),
    ];

    let sessions = [
        MixSession::start(to_alice, vec![Arc::new(ChannelSink::new(alice_tx))], SessionConfig::default()).await?,
        MixSession::start(to_bob, vec![Arc::new(ChannelSink::new(bob_tx))], SessionConfig::default()).await?,
        // Local playout skips frames rather than lagging behind the call.
        MixSession::start(
            speaker,
            vec![Arc::new(ChannelSink::lossy(speaker_tx).named("speaker"))],
            SessionConfig::default(),
        )
        .await?,
    ];

    println!("Mixing {FRAMES} frames of {FRAME} samples...");
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    for n in 0..FRAMES {
        ticker.tick().await;
        if n == FRAMES / 2 {
            sessions[0].output().add_dtmf(DtmfTone::Digit5);
        }
        mic.push_samples(&voice(20, 4000, n * FRAME));
        alice.push_samples(&voice(9, 3000, n * FRAME));
        bob.push_samples(&voice(31, 2000, n * FRAME));
    }

    println!("\nSession stats:");
    for (session, (name, _)) in sessions.iter().zip(&counters) {
        let stats = session.stats();
        println!(
            "  {name}: {} forwarded, {} dropped, {} silent cycles",
            stats.chunks_forwarded, stats.chunks_dropped, stats.silent_cycles
        );
    }
    for session in sessions {
        session.stop().await?;
    }
    drop(mixer);

    println!("\nDelivered:");
    for (name, counter) in counters {
        let (chunks, samples) = counter.await?;
        println!("  {name}: {chunks} chunks, {samples} samples");
    }

    Ok(())
}
