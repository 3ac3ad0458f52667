//! Integration tests for conference-mixer.
//!
//! Everything runs against `MockSource`, so no audio hardware is needed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conference_mixer::{
    AudioChunk, AudioFormat, AudioMixer, ChannelSink, CycleTrigger, DtmfTone, InputSource,
    MixSession, MixerConfig, MixerError, MixerEvent, MockSource, OutputMixId, PushStream, SampleDepth,
    SessionConfig, Sink, SinkError, SourceError, Transcoder, TranscoderFactory,
};
use tokio::sync::mpsc;

fn pcm(rate: u32) -> AudioFormat {
    AudioFormat::pcm_le(rate, 16, 1)
}

fn mock(name: &str) -> Arc<MockSource> {
    Arc::new(MockSource::new(name, pcm(8000)))
}

/// Counts events matching `filter`.
fn counter(filter: fn(&MixerEvent) -> bool) -> (Arc<AtomicUsize>, impl Fn(MixerEvent) + Send + Sync) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |event: MixerEvent| {
        if filter(&event) {
            inner.fetch_add(1, Ordering::SeqCst);
        }
    })
}

/// Polls `cond` for up to a second.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[test]
fn test_three_sources_mix_in_one_cycle() {
    let mixer = AudioMixer::builder()
        .with_config(MixerConfig {
            trigger: CycleTrigger::PrimaryStream,
            ..Default::default()
        })
        .build();
    let a = mock("a");
    let b = mock("b");
    let c = mock("c");
    for source in [&a, &b, &c] {
        mixer.add_input_source(source.clone(), None).unwrap();
    }

    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    // Only the first stream drives cycles, so b and c queue up.
    b.push_samples(&[50; 6]);
    c.push_samples(&[0, 0]);
    assert!(output.read_chunk().is_none());
    a.push_samples(&[100; 6]);

    let chunk = output.read_chunk().unwrap();
    assert_eq!(chunk.samples.as_slice(), &[150; 6]);
    assert_eq!(chunk.format.depth, SampleDepth::Bits16);
}

#[test]
fn test_each_listener_misses_only_itself() {
    let mixer = AudioMixer::builder()
        .with_config(MixerConfig {
            trigger: CycleTrigger::PrimaryStream,
            ..Default::default()
        })
        .build();
    let alice = mock("alice");
    let bob = mock("bob");
    let to_alice = mixer.create_output_mix();
    let to_bob = mixer.create_output_mix();
    mixer.add_input_source(alice.clone(), Some(&to_alice)).unwrap();
    mixer.add_input_source(bob.clone(), Some(&to_bob)).unwrap();

    for output in [&to_alice, &to_bob] {
        output.connect();
        output.start().unwrap();
    }

    bob.push_samples(&[20; 4]);
    alice.push_samples(&[300; 4]);

    assert_eq!(to_alice.read_chunk().unwrap().samples.as_slice(), &[20; 4]);
    assert_eq!(to_bob.read_chunk().unwrap().samples.as_slice(), &[300; 4]);
}

#[test]
fn test_duplicate_source_is_rejected() {
    let mixer = AudioMixer::builder().build();
    let source = mock("twice");
    mixer.add_input_source(source.clone(), None).unwrap();
    assert!(matches!(
        mixer.add_input_source(source, None),
        Err(MixerError::DuplicateSource { .. })
    ));
}

#[test]
fn test_removal_while_cycles_run() {
    let mixer = AudioMixer::builder().build();
    let keep = mock("keep");
    let gone = mock("gone");
    mixer.add_input_source(keep.clone(), None).unwrap();
    mixer.add_input_source(gone.clone(), None).unwrap();
    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let producers: Vec<_> = [keep.clone(), gone.clone()]
        .into_iter()
        .map(|source| {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    source.push_samples(&[10; 80]);
                    std::thread::yield_now();
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    assert!(mixer.remove_input_source(&gone));
    assert!(!gone.has_transfer_handler());
    assert!(!gone.is_connected());

    stop.store(true, Ordering::SeqCst);
    for producer in producers {
        producer.join().unwrap();
    }
    let _ = output.read_chunk();

    gone.push_samples(&[1000; 80]);
    keep.push_samples(&[10; 80]);
    let chunk = output.read_chunk().unwrap();
    assert!(chunk.samples.iter().all(|&s| s == 10));
    assert_eq!(mixer.source_count(), 1);
}

#[test]
fn test_pool_buffers_are_reused() {
    let mixer = AudioMixer::builder().build();
    let source = mock("steady");
    mixer.add_input_source(source.clone(), None).unwrap();
    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    for _ in 0..100 {
        source.push_samples(&[1; 160]);
    }
    let stats = mixer.pool_stats();
    assert_eq!(stats.fresh_allocations, 1);
    assert_eq!(stats.reused, 99);
    assert_eq!(output.frames_mixed(), 100);
}

#[test]
fn test_capture_mute_and_dtmf() {
    let mic = mock("mic");
    let mixer = AudioMixer::builder().capture_source(mic.clone()).build();
    let peer = mock("peer");
    let to_peer = mixer.create_output_mix();
    mixer.add_input_source(peer.clone(), Some(&to_peer)).unwrap();
    to_peer.connect();
    to_peer.start().unwrap();

    mic.push_samples(&[400; 160]);
    assert_eq!(to_peer.read_chunk().unwrap().samples.as_slice(), &[400; 160]);

    to_peer.set_mute(true);
    assert!(to_peer.is_mute());
    mic.push_samples(&[400; 160]);
    assert!(to_peer.read_chunk().is_none());

    to_peer.add_dtmf(DtmfTone::Pound);
    to_peer.add_dtmf(DtmfTone::Digit9);
    mic.push_samples(&[400; 160]);
    let expected = DtmfTone::Pound.render(8000, SampleDepth::Bits16, 1);
    assert_eq!(to_peer.read_chunk().unwrap().samples.as_slice(), expected.as_slice());
    assert!(to_peer.is_sending_dtmf());

    mic.push_samples(&[400; 160]);
    let expected = DtmfTone::Digit9.render(8000, SampleDepth::Bits16, 1);
    assert_eq!(to_peer.read_chunk().unwrap().samples.as_slice(), expected.as_slice());
    assert!(!to_peer.is_sending_dtmf());
}

#[test]
fn test_rate_mismatch_warns_once() {
    let (mismatches, on_event) = counter(|e| matches!(e, MixerEvent::SampleRateMismatch { .. }));
    let mixer = AudioMixer::builder().on_event(on_event).build();
    let narrow = mock("narrow");
    let wide = Arc::new(MockSource::new("wide", pcm(16000)));
    mixer.add_input_source(narrow, None).unwrap();
    mixer.add_input_source(wide.clone(), None).unwrap();
    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    wide.push_samples(&[8; 10]);
    wide.push_samples(&[8; 10]);
    assert_eq!(mismatches.load(Ordering::SeqCst), 1);
    // Mixed without resampling.
    assert_eq!(output.read_chunk().unwrap().samples.len(), 10);
    assert_eq!(mixer.canonical_format().sample_rate, 8000);
}

#[test]
fn test_timestamps_flow_through() {
    let mixer = AudioMixer::builder().build();
    let source = mock("timed");
    mixer.add_input_source(source.clone(), None).unwrap();
    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    source.set_next_timestamp(Duration::from_millis(260));
    source.push_samples(&[1; 8]);
    assert_eq!(output.read_chunk().unwrap().timestamp, Some(Duration::from_millis(260)));
}

#[test]
fn test_output_mix_feeds_another_mixer() {
    let upstream = AudioMixer::builder().build();
    let speaker = mock("speaker");
    upstream.add_input_source(speaker.clone(), None).unwrap();
    let relay = upstream.create_output_mix();

    let downstream = AudioMixer::builder().build();
    downstream.add_input_source(Arc::new(relay.clone()), None).unwrap();
    let listener = downstream.create_output_mix();
    listener.connect();
    listener.start().unwrap();
    assert!(relay.is_started());

    speaker.push_samples(&[-1234; 16]);
    assert_eq!(listener.read_chunk().unwrap().samples.as_slice(), &[-1234; 16]);

    listener.disconnect();
    assert!(!relay.is_connected());
    assert!(!speaker.is_connected());
}

/// Decodes an encoded source into a PCM mock after a slow connect.
struct SlowDecoder {
    encoded: Arc<dyn InputSource>,
    decoded: Arc<MockSource>,
    delay: Duration,
}

impl InputSource for SlowDecoder {
    fn name(&self) -> &str {
        "decoder"
    }

    fn connect(&self) -> Result<(), SourceError> {
        std::thread::sleep(self.delay);
        self.encoded.connect()?;
        self.decoded.connect()
    }

    fn disconnect(&self) {
        self.decoded.disconnect();
        self.encoded.disconnect();
    }

    fn start(&self) -> Result<(), SourceError> {
        self.encoded.start()?;
        self.decoded.start()
    }

    fn stop(&self) {
        self.decoded.stop();
        self.encoded.stop();
    }

    fn streams(&self) -> Vec<Arc<dyn PushStream>> {
        self.decoded.streams()
    }

    fn format(&self) -> Option<AudioFormat> {
        InputSource::format(self.decoded.as_ref())
    }
}

impl Transcoder for SlowDecoder {
    fn connects_asynchronously(&self) -> bool {
        true
    }
}

struct DecoderFactory {
    decoded: Arc<MockSource>,
    delay: Duration,
}

impl TranscoderFactory for DecoderFactory {
    fn create(&self, source: Arc<dyn InputSource>) -> Result<Arc<dyn Transcoder>, SourceError> {
        Ok(Arc::new(SlowDecoder {
            encoded: source,
            decoded: Arc::clone(&self.decoded),
            delay: self.delay,
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_transcoder_joins_when_connected() {
    let decoded = mock("decoded");
    let (connected, on_event) = counter(|e| matches!(e, MixerEvent::TranscoderConnected { .. }));
    let mixer = AudioMixer::builder()
        .transcoder_factory(Arc::new(DecoderFactory {
            decoded: decoded.clone(),
            delay: Duration::from_millis(30),
        }))
        .on_event(on_event)
        .build();

    let opus = Arc::new(MockSource::new("opus", AudioFormat::encoded("opus", 8000, 1)));
    let local = mock("local");
    mixer.add_input_source(opus.clone(), None).unwrap();
    mixer.add_input_source(local.clone(), None).unwrap();

    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();

    // The rest of the mix does not wait for the transcoder.
    local.push_samples(&[5; 4]);
    assert_eq!(output.read_chunk().unwrap().samples.as_slice(), &[5; 4]);

    assert!(eventually(|| decoded.has_transfer_handler()).await);
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert!(mixer.transcoder_for(&opus).is_some());
    assert!(decoded.is_started());

    decoded.push_samples(&[70; 4]);
    assert_eq!(output.read_chunk().unwrap().samples.as_slice(), &[70; 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_source_removed_before_transcoder_connects_never_rejoins() {
    let decoded = mock("decoded");
    let mixer = AudioMixer::builder()
        .transcoder_factory(Arc::new(DecoderFactory {
            decoded: decoded.clone(),
            delay: Duration::from_millis(50),
        }))
        .build();
    let opus = Arc::new(MockSource::new("opus", AudioFormat::encoded("opus", 8000, 1)));
    mixer.add_input_source(opus.clone(), None).unwrap();

    let output = mixer.create_output_mix();
    output.connect();
    output.start().unwrap();
    assert!(mixer.remove_input_source(&opus));

    // The orphaned transcoder connects, then is disconnected again.
    assert!(eventually(|| decoded.connect_calls() == 1 && !decoded.is_connected()).await);
    assert_eq!(decoded.disconnect_calls(), 1);
    assert!(!decoded.has_transfer_handler());
    assert_eq!(mixer.source_count(), 0);
}

/// A sink failing its first `failures` writes.
struct FlakySink {
    failures: AtomicUsize,
    writes: AtomicUsize,
    stopped: AtomicBool,
}

impl FlakySink {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            writes: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Sink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn on_stop(&self, _output: OutputMixId) -> Result<(), SinkError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, _output: OutputMixId, _chunk: &AudioChunk) -> Result<(), SinkError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::custom("transient"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_session_delivers_to_every_sink() {
    let (sink_errors, on_event) = counter(|e| matches!(e, MixerEvent::SinkError { .. }));
    let mixer = AudioMixer::builder().on_event(on_event).build();
    let peer = mock("peer");
    mixer.add_input_source(peer.clone(), None).unwrap();

    let (tx, mut rx) = mpsc::channel::<AudioChunk>(16);
    let flaky = FlakySink::new(1);
    let session = MixSession::start(
        mixer.create_output_mix(),
        vec![Arc::new(ChannelSink::new(tx)), flaky.clone()],
        SessionConfig {
            sink_retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(session.is_running());

    peer.push_samples(&[123; 160]);
    let chunk = rx.recv().await.unwrap();
    assert_eq!(chunk.samples.as_slice(), &[123; 160]);
    assert_eq!(chunk.duration(), Duration::from_millis(20));

    assert!(eventually(|| flaky.writes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(sink_errors.load(Ordering::SeqCst), 1);

    let stats = session.stats();
    assert_eq!(stats.chunks_forwarded, 1);
    assert_eq!(stats.samples_mixed, 160);

    session.stop().await.unwrap();
    assert!(!peer.is_started());
    assert!(!mixer.is_connected());
    assert!(flaky.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_allocation_failure_ends_every_session() {
    let (cycle_failures, on_event) = counter(|e| matches!(e, MixerEvent::CycleFailed { .. }));
    let mixer = AudioMixer::builder()
        .on_event(on_event)
        .with_config(MixerConfig {
            max_buffer_samples: 320,
            ..Default::default()
        })
        .build();
    let alice = mock("alice");
    let bob = mock("bob");
    let to_alice = mixer.create_output_mix();
    let to_bob = mixer.create_output_mix();
    mixer.add_input_source(alice.clone(), Some(&to_alice)).unwrap();
    mixer.add_input_source(bob.clone(), Some(&to_bob)).unwrap();

    let alice_sink = FlakySink::new(0);
    let bob_sink = FlakySink::new(0);
    let for_alice = MixSession::start(to_alice, vec![alice_sink.clone()], SessionConfig::default())
        .await
        .unwrap();
    let for_bob = MixSession::start(to_bob, vec![bob_sink.clone()], SessionConfig::default())
        .await
        .unwrap();

    bob.push_samples(&[5; 160]);
    assert!(eventually(|| alice_sink.writes.load(Ordering::SeqCst) == 1).await);

    // One oversized burst fails the whole cycle.
    bob.push_samples(&[5; 400]);
    assert_eq!(cycle_failures.load(Ordering::SeqCst), 1);
    assert!(!for_alice.is_running());
    assert!(!for_bob.is_running());

    assert!(eventually(|| alice_sink.stopped.load(Ordering::SeqCst) && bob_sink.stopped.load(Ordering::SeqCst)).await);
    assert!(eventually(|| !mixer.is_connected()).await);
    assert!(!alice.is_started());

    for session in [for_alice, for_bob] {
        let err = session.stop().await.unwrap_err();
        assert!(matches!(err, MixerError::BufferAllocation { requested: 400 }));
    }
}

#[tokio::test]
async fn test_session_stop_drains_pending_chunks() {
    let mixer = AudioMixer::builder().build();
    let peer = mock("peer");
    mixer.add_input_source(peer.clone(), None).unwrap();

    let (tx, mut rx) = mpsc::channel::<AudioChunk>(16);
    let session = MixSession::start(
        mixer.create_output_mix(),
        vec![Arc::new(ChannelSink::new(tx))],
        SessionConfig::default(),
    )
    .await
    .unwrap();

    for value in 1..=3 {
        peer.push_samples(&[value; 8]);
    }
    session.stop().await.unwrap();

    let mut received = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        received.push(chunk.samples[0]);
    }
    assert_eq!(received, vec![1, 2, 3]);
}
