//! Mock input source for testing without hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::format::{AudioFormat, SampleDepth};
use crate::source::{InputSource, MediaBuffer, PushStream, TransferHandler};
use crate::SourceError;

/// Bytes of pending audio a mock stream holds before dropping pushes.
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// An in-memory push source with a single stream.
///
/// Pushed audio is queued in a ring buffer and the installed transfer
/// handler is invoked from the pushing thread, exactly like a real
/// producer's callback. This allows testing the full mixing pipeline
/// without audio hardware, making it suitable for CI environments.
///
/// # Example
///
/// ```
/// use conference_mixer::{AudioFormat, InputSource, MockSource};
///
/// let mock = MockSource::new("alice", AudioFormat::pcm_le(8000, 16, 1));
/// mock.connect().unwrap();
/// mock.start().unwrap();
///
/// // Queue 20ms of a constant signal and notify the reader
/// mock.push_samples(&[100; 160]);
/// assert_eq!(mock.pending_bytes(), 320);
/// ```
pub struct MockSource {
    name: String,
    stream: Arc<MockStream>,
    connected: AtomicBool,
    started: AtomicBool,
    fail_connect: AtomicBool,
    accept_format: AtomicBool,
    buffer_length: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    format_requests: AtomicUsize,
}

struct MockStream {
    format: Mutex<AudioFormat>,
    producer: Mutex<HeapProd<u8>>,
    consumer: Mutex<HeapCons<u8>>,
    silence: AtomicBool,
    timestamp: Mutex<Option<Duration>>,
    handler: Mutex<Option<TransferHandler>>,
}

impl MockSource {
    /// Creates a mock source delivering `format`.
    pub fn new(name: impl Into<String>, format: AudioFormat) -> Self {
        Self::with_capacity(name, format, DEFAULT_CAPACITY)
    }

    /// Creates a mock source whose queue holds `capacity` bytes.
    pub fn with_capacity(name: impl Into<String>, format: AudioFormat, capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::<u8>::new(capacity.max(1)).split();
        Self {
            name: name.into(),
            stream: Arc::new(MockStream {
                format: Mutex::new(format),
                producer: Mutex::new(producer),
                consumer: Mutex::new(consumer),
                silence: AtomicBool::new(false),
                timestamp: Mutex::new(None),
                handler: Mutex::new(None),
            }),
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            accept_format: AtomicBool::new(false),
            buffer_length: Mutex::new(None),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            format_requests: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Makes `set_format` accept format changes.
    pub fn accept_format_changes(&self, accept: bool) {
        self.accept_format.store(accept, Ordering::SeqCst);
    }

    /// Queues raw bytes and notifies the reader if the source is started.
    ///
    /// Returns the number of bytes queued; the rest did not fit.
    pub fn push_bytes(&self, bytes: &[u8]) -> usize {
        let queued = self.stream.producer.lock().push_slice(bytes);
        if queued < bytes.len() {
            tracing::debug!(
                source = %self.name,
                dropped = bytes.len() - queued,
                "mock queue full"
            );
        }
        self.notify();
        queued
    }

    /// Queues samples encoded in the stream's current format.
    ///
    /// Samples are given as signed values at the format's depth and are
    /// written with its signedness and byte order.
    pub fn push_samples(&self, samples: &[i32]) -> usize {
        let format = self.stream.format.lock().clone();
        let bytes = encode_for(&format, samples);
        self.push_bytes(&bytes)
    }

    /// Marks the next read as silence carrying `frames` frames of length.
    pub fn push_silence(&self, frames: usize) {
        let format = self.stream.format.lock().clone();
        let width = usize::from(format.sample_size_bits / 8).max(1) * usize::from(format.channels);
        self.stream.silence.store(true, Ordering::SeqCst);
        self.push_bytes(&vec![0u8; frames * width]);
    }

    /// Sets the timestamp reported with the next read.
    pub fn set_next_timestamp(&self, timestamp: Duration) {
        *self.stream.timestamp.lock() = Some(timestamp);
    }

    /// Bytes queued and not yet read.
    pub fn pending_bytes(&self) -> usize {
        self.stream.consumer.lock().occupied_len()
    }

    /// Returns `true` while connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns `true` while started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns `true` if a reader installed a transfer handler.
    pub fn has_transfer_handler(&self) -> bool {
        self.stream.handler.lock().is_some()
    }

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Number of `start` calls.
    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of `set_format` calls, refused ones included.
    pub fn format_requests(&self) -> usize {
        self.format_requests.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        if !self.is_started() {
            return;
        }
        // Clone out so the handler runs without our lock held.
        let handler = self.stream.handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl std::fmt::Debug for MockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSource")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl InputSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<(), SourceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SourceError::connect_failed("mock configured to fail"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn start(&self) -> Result<(), SourceError> {
        if !self.is_connected() {
            return Err(SourceError::NotConnected);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }

    fn streams(&self) -> Vec<Arc<dyn PushStream>> {
        if !self.is_connected() {
            return Vec::new();
        }
        vec![Arc::clone(&self.stream) as Arc<dyn PushStream>]
    }

    fn format(&self) -> Option<AudioFormat> {
        Some(self.stream.format.lock().clone())
    }

    fn set_format(&self, format: &AudioFormat) -> Result<(), SourceError> {
        self.format_requests.fetch_add(1, Ordering::SeqCst);
        if !self.accept_format.load(Ordering::SeqCst) {
            return Err(SourceError::custom("mock format is fixed"));
        }
        *self.stream.format.lock() = format.clone();
        Ok(())
    }

    fn buffer_length(&self) -> Option<Duration> {
        *self.buffer_length.lock()
    }

    fn set_buffer_length(&self, length: Duration) {
        *self.buffer_length.lock() = Some(length);
    }
}

impl PushStream for MockStream {
    fn format(&self) -> AudioFormat {
        self.format.lock().clone()
    }

    fn read(&self, buffer: &mut MediaBuffer) -> Result<(), SourceError> {
        let mut consumer = self.consumer.lock();
        let available = consumer.occupied_len();
        buffer.data.resize(available, 0);
        let read = consumer.pop_slice(&mut buffer.data);
        buffer.data.truncate(read);
        drop(consumer);

        buffer.flags.silence = self.silence.swap(false, Ordering::SeqCst);
        buffer.timestamp = self.timestamp.lock().take();
        Ok(())
    }

    fn set_transfer_handler(&self, handler: Option<TransferHandler>) {
        *self.handler.lock() = handler;
    }
}

/// Encodes signed samples in the byte layout of `format`.
fn encode_for(format: &AudioFormat, samples: &[i32]) -> Vec<u8> {
    let unsigned = format.signedness == crate::format::Signedness::Unsigned;
    let big_endian = format.endianness == crate::format::Endianness::Big;
    let depth = SampleDepth::from_bits(format.sample_size_bits).unwrap_or(SampleDepth::Bits16);
    let mut out = Vec::with_capacity(samples.len() * depth.bytes());
    for &sample in samples {
        match depth {
            SampleDepth::Bits8 => {
                let value = if unsigned {
                    (sample + 128) as u8
                } else {
                    sample as i8 as u8
                };
                out.push(value);
            }
            SampleDepth::Bits16 => {
                let value = if unsigned {
                    (sample + 32768) as u16
                } else {
                    sample as i16 as u16
                };
                if big_endian {
                    out.extend_from_slice(&value.to_be_bytes());
                } else {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            SampleDepth::Bits32 => {
                let value = if unsigned {
                    (sample as u32) ^ 0x8000_0000
                } else {
                    sample as u32
                };
                if big_endian {
                    out.extend_from_slice(&value.to_be_bytes());
                } else {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Endianness, Signedness};

    fn started(format: AudioFormat) -> MockSource {
        let mock = MockSource::new("mock", format);
        mock.connect().unwrap();
        mock.start().unwrap();
        mock
    }

    #[test]
    fn test_push_fires_handler_when_started() {
        let mock = started(AudioFormat::pcm_le(8000, 16, 1));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        mock.streams()[0].set_transfer_handler(Some(Arc::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));

        mock.push_samples(&[1, 2, 3]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        mock.stop();
        mock.push_samples(&[4]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_drains_queue() {
        let mock = started(AudioFormat::pcm_le(8000, 16, 1));
        mock.push_samples(&[100, -100]);

        let stream = &mock.streams()[0];
        let mut buffer = MediaBuffer::new();
        stream.read(&mut buffer).unwrap();
        assert_eq!(buffer.data, vec![0x64, 0x00, 0x9c, 0xff]);
        assert_eq!(mock.pending_bytes(), 0);
    }

    #[test]
    fn test_silence_flag_applies_to_one_read() {
        let mock = started(AudioFormat::pcm_le(8000, 16, 1));
        mock.push_silence(4);

        let stream = &mock.streams()[0];
        let mut buffer = MediaBuffer::new();
        stream.read(&mut buffer).unwrap();
        assert!(buffer.is_silence());
        assert_eq!(buffer.data.len(), 8);

        buffer.reset();
        stream.read(&mut buffer).unwrap();
        assert!(!buffer.is_silence());
    }

    #[test]
    fn test_encodes_unsigned_big_endian() {
        let format = AudioFormat::linear(8000, 16, 1, Signedness::Unsigned, Endianness::Big);
        let mock = started(format);
        mock.push_samples(&[0]);

        let mut buffer = MediaBuffer::new();
        mock.streams()[0].read(&mut buffer).unwrap();
        assert_eq!(buffer.data, vec![0x80, 0x00]);
    }

    #[test]
    fn test_fail_connect() {
        let mock = MockSource::new("broken", AudioFormat::pcm_le(8000, 16, 1));
        mock.fail_connect(true);
        assert!(mock.connect().is_err());
        assert!(!mock.is_connected());
        assert!(mock.streams().is_empty());
    }

    #[test]
    fn test_set_format_refused_by_default() {
        let mock = MockSource::new("fixed", AudioFormat::pcm_le(16000, 16, 1));
        assert!(mock.set_format(&AudioFormat::pcm_le(8000, 16, 1)).is_err());

        mock.accept_format_changes(true);
        mock.set_format(&AudioFormat::pcm_le(8000, 16, 1)).unwrap();
        assert_eq!(mock.format().unwrap().sample_rate, 8000);
        assert_eq!(mock.format_requests(), 2);
    }
}
