//! Streaming audio sink: a bounded chunk queue drained by one playback thread.
//!
//! Producers (the local engine callback or a remote download) push chunks
//! without ever blocking; when the queue is full the oldest queued chunk is
//! evicted. The consumer converts samples to PCM16, writes them to the
//! device in arrival order and fires the completion callback once per
//! end-of-stream marker, then waits for the next stream.

pub mod device;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::error::{Result, VoiceError};
use crate::types::AudioChunk;

pub use device::{AudioOutput, PlaybackDevice, RodioOutput};

pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    on_complete: Mutex<Option<CompletionCallback>>,
    running: AtomicBool,
    completed_streams: AtomicU64,
}

struct Consumer {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct StreamingAudioSink {
    shared: Arc<Shared>,
    chunk_tx: Sender<AudioChunk>,
    /// Consumer end. The producer side also uses it to evict when full.
    chunk_rx: Receiver<AudioChunk>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
    output: Arc<dyn AudioOutput>,
    capacity: usize,
    sample_rate: u32,
    join_timeout: Duration,
    consumer: Mutex<Option<Consumer>>,
    released: AtomicBool,
    dropped: AtomicU64,
}

impl StreamingAudioSink {
    pub fn new(config: &SinkConfig, output: Arc<dyn AudioOutput>) -> Self {
        let capacity = config.capacity.max(1);
        let (chunk_tx, chunk_rx) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                on_complete: Mutex::new(None),
                running: AtomicBool::new(false),
                completed_streams: AtomicU64::new(0),
            }),
            chunk_tx,
            chunk_rx,
            shutdown_tx,
            shutdown_rx,
            output,
            capacity,
            sample_rate: config.sample_rate,
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            consumer: Mutex::new(None),
            released: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Called once after the last chunk of each stream has been played.
    pub fn set_on_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queued_len(&self) -> usize {
        self.chunk_rx.len()
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn completed_streams(&self) -> u64 {
        self.shared.completed_streams.load(Ordering::SeqCst)
    }

    /// Start the playback thread. Returns false if the device cannot be opened
    /// or the sink has been released.
    pub fn start(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            warn!("Audio sink already released");
            return false;
        }

        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        if consumer.is_some() && self.is_running() {
            return true;
        }
        if let Some(stale) = consumer.take() {
            let _ = stale.handle.join();
        }

        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let output = Arc::clone(&self.output);
        let chunks = self.chunk_rx.clone();
        let shutdown = self.shutdown_rx.clone();
        let sample_rate = self.sample_rate;

        let spawned = std::thread::Builder::new()
            .name("audio-sink".into())
            .spawn(move || {
                let mut device = match output.open(sample_rate) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                shared.running.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                consume(&shared, &chunks, &shutdown, device.as_mut());

                device.close();
                shared.running.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to spawn playback thread: {e}");
                return false;
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio sink started ({}Hz, capacity {})", self.sample_rate, self.capacity);
                *consumer = Some(Consumer {
                    handle,
                    done: done_rx,
                });
                true
            }
            Ok(Err(e)) => {
                warn!("Failed to open playback device: {e}");
                let _ = handle.join();
                false
            }
            Err(_) => {
                warn!("Playback thread exited before opening the device");
                let _ = handle.join();
                false
            }
        }
    }

    /// Queue a chunk without blocking. Evicts the oldest queued chunk when full.
    pub fn push(&self, chunk: AudioChunk) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(VoiceError::ResourceReleased);
        }

        let mut chunk = chunk;
        loop {
            match self.chunk_tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    chunk = back;
                    if self.chunk_rx.try_recv().is_ok() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("Audio queue full, dropped oldest chunk ({total} dropped so far)");
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(VoiceError::ResourceReleased),
            }
        }
    }

    /// Stop playback and free the device. Later calls are no-ops.
    ///
    /// Waits at most `join_timeout` for the playback thread; a thread stuck
    /// in the device is detached.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.chunk_rx.try_iter().count();
        if pending > 0 {
            debug!("Discarded {pending} unplayed chunks on release");
        }
        let _ = self.shutdown_tx.try_send(());

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            match consumer.done.recv_timeout(self.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = consumer.handle.join();
                    info!("Audio sink released");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Playback thread did not stop within {}ms, detaching",
                        self.join_timeout.as_millis()
                    );
                }
            }
        }
    }
}

impl Drop for StreamingAudioSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Consumer loop. Returns on the shutdown signal.
fn consume(
    shared: &Shared,
    chunks: &Receiver<AudioChunk>,
    shutdown: &Receiver<()>,
    device: &mut dyn PlaybackDevice,
) {
    loop {
        let chunk = select! {
            recv(shutdown) -> _ => return,
            recv(chunks) -> chunk => match chunk {
                Ok(chunk) => chunk,
                Err(_) => return,
            },
        };

        if !chunk.samples.is_empty() {
            if let Err(e) = device.write(&to_pcm16(&chunk.samples)) {
                warn!("Playback write failed: {e}");
            }
        }

        if chunk.is_end_of_stream() {
            device.drain();
            let n = shared.completed_streams.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Audio stream #{n} finished");
            let callback = shared
                .on_complete
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

/// Convert one normalized sample to PCM16. Out-of-range input is clamped,
/// NaN becomes silence.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_pcm16(s)).collect()
}

/// Write mono samples as a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> std::result::Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample_to_pcm16(sample))?;
    }
    writer.finalize()?;
    info!("Saved {} samples to {}", samples.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct DeviceLog {
        writes: Mutex<Vec<Vec<i16>>>,
        drains: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeOutput {
        log: Arc<DeviceLog>,
        fail: bool,
    }

    struct FakeDevice {
        log: Arc<DeviceLog>,
    }

    impl AudioOutput for FakeOutput {
        fn open(&self, _sample_rate: u32) -> std::result::Result<Box<dyn PlaybackDevice>, String> {
            if self.fail {
                return Err("device busy".into());
            }
            Ok(Box::new(FakeDevice {
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl PlaybackDevice for FakeDevice {
        fn write(&mut self, samples: &[i16]) -> std::result::Result<(), String> {
            self.log.writes.lock().unwrap().push(samples.to_vec());
            Ok(())
        }

        fn drain(&mut self) {
            self.log.drains.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&mut self) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A device whose writes hang until `unstick` is dropped.
    struct StuckOutput {
        entered: Sender<()>,
        unstick: Receiver<()>,
        log: Arc<DeviceLog>,
    }

    struct StuckDevice {
        entered: Sender<()>,
        unstick: Receiver<()>,
        log: Arc<DeviceLog>,
    }

    impl AudioOutput for StuckOutput {
        fn open(&self, _sample_rate: u32) -> std::result::Result<Box<dyn PlaybackDevice>, String> {
            Ok(Box::new(StuckDevice {
                entered: self.entered.clone(),
                unstick: self.unstick.clone(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl PlaybackDevice for StuckDevice {
        fn write(&mut self, _samples: &[i16]) -> std::result::Result<(), String> {
            let _ = self.entered.try_send(());
            let _ = self.unstick.recv();
            Err("device went away".into())
        }

        fn drain(&mut self) {}

        fn close(&mut self) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sink_with_capacity(capacity: usize) -> (StreamingAudioSink, Arc<DeviceLog>) {
        let log = Arc::new(DeviceLog::default());
        let config = SinkConfig {
            capacity,
            ..SinkConfig::default()
        };
        let output = FakeOutput {
            log: Arc::clone(&log),
            fail: false,
        };
        (StreamingAudioSink::new(&config, Arc::new(output)), log)
    }

    fn completion_channel(sink: &StreamingAudioSink) -> Receiver<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        sink.set_on_complete(move || {
            let _ = tx.send(());
        });
        rx
    }

    fn queued_firsts(sink: &StreamingAudioSink) -> Vec<Option<f32>> {
        sink.chunk_rx
            .try_iter()
            .map(|c| c.samples.first().copied())
            .collect()
    }

    #[test]
    fn pcm16_conversion_clamps_silently() {
        assert_eq!(sample_to_pcm16(0.0), 0);
        assert_eq!(sample_to_pcm16(1.0), 32767);
        assert_eq!(sample_to_pcm16(-1.0), -32767);
        assert_eq!(sample_to_pcm16(0.5), 16384);
        assert_eq!(sample_to_pcm16(3.5), 32767);
        assert_eq!(sample_to_pcm16(-7.0), -32767);
        assert_eq!(sample_to_pcm16(f32::INFINITY), 32767);
        assert_eq!(sample_to_pcm16(f32::NEG_INFINITY), -32767);
        assert_eq!(sample_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn chunks_play_in_order_and_complete_once() {
        let (sink, log) = sink_with_capacity(16);
        let done = completion_channel(&sink);

        sink.push(AudioChunk::new(vec![0.1])).unwrap();
        sink.push(AudioChunk::new(vec![0.2])).unwrap();
        sink.push(AudioChunk::new(vec![0.3])).unwrap();
        sink.push(AudioChunk::end_of_stream()).unwrap();
        assert!(sink.start());

        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done.recv_timeout(Duration::from_millis(100)).is_err());

        let writes = log.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![to_pcm16(&[0.1]), to_pcm16(&[0.2]), to_pcm16(&[0.3])]);
        assert_eq!(log.drains.load(Ordering::SeqCst), 1);
        assert_eq!(sink.completed_streams(), 1);
    }

    #[test]
    fn consumer_stays_up_for_the_next_stream() {
        let (sink, log) = sink_with_capacity(16);
        let done = completion_channel(&sink);
        assert!(sink.start());

        sink.push(AudioChunk::new(vec![0.5, 0.5])).unwrap();
        sink.push(AudioChunk::end_of_stream()).unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sink.is_running());

        sink.push(AudioChunk::new(vec![-0.5])).unwrap();
        sink.push(AudioChunk::new(Vec::new())).unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(sink.completed_streams(), 2);
        assert_eq!(log.writes.lock().unwrap().len(), 2);
        assert_eq!(log.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_queue_drops_oldest_without_blocking() {
        let (sink, _log) = sink_with_capacity(3);
        for i in 0..4 {
            sink.push(AudioChunk::new(vec![i as f32 / 10.0])).unwrap();
        }
        assert_eq!(sink.queued_len(), 3);
        assert_eq!(sink.dropped_chunks(), 1);
        assert_eq!(queued_firsts(&sink), vec![Some(0.1), Some(0.2), Some(0.3)]);
    }

    #[test]
    fn overflow_evicts_strictly_the_oldest_item() {
        let (sink, _log) = sink_with_capacity(2);
        sink.push(AudioChunk::end_of_stream()).unwrap();
        sink.push(AudioChunk::new(vec![0.1])).unwrap();
        sink.push(AudioChunk::new(vec![0.2])).unwrap();
        sink.push(AudioChunk::end_of_stream()).unwrap();

        assert_eq!(sink.dropped_chunks(), 2);
        let kept: Vec<AudioChunk> = sink.chunk_rx.try_iter().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].samples, vec![0.2]);
        assert!(kept[1].is_end_of_stream());
    }

    #[test]
    fn start_is_idempotent() {
        let (sink, log) = sink_with_capacity(4);
        assert!(sink.start());
        assert!(sink.start());
        sink.release();
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_reports_unavailable_device() {
        let log = Arc::new(DeviceLog::default());
        let output = FakeOutput { log, fail: true };
        let sink = StreamingAudioSink::new(&SinkConfig::default(), Arc::new(output));
        assert!(!sink.start());
        assert!(!sink.is_running());
    }

    #[test]
    fn zero_sample_rate_is_refused_by_the_speaker() {
        let config = SinkConfig {
            sample_rate: 0,
            ..SinkConfig::default()
        };
        let sink = StreamingAudioSink::new(&config, Arc::new(RodioOutput::new(250)));
        assert!(!sink.start());
        assert!(!sink.is_running());
    }

    #[test]
    fn release_is_idempotent_and_closes_device_once() {
        let (sink, log) = sink_with_capacity(4);
        assert!(sink.start());
        sink.push(AudioChunk::new(vec![0.1])).unwrap();

        sink.release();
        sink.release();
        assert!(!sink.is_running());
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);

        assert_eq!(
            sink.push(AudioChunk::new(vec![0.2])).unwrap_err(),
            VoiceError::ResourceReleased
        );
        assert!(!sink.start());
        drop(sink);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_gives_up_on_a_stuck_device_after_the_join_timeout() {
        let (entered_tx, entered_rx) = bounded(1);
        let (unstick_tx, unstick_rx) = bounded::<()>(0);
        let log = Arc::new(DeviceLog::default());
        let config = SinkConfig {
            join_timeout_ms: 150,
            ..SinkConfig::default()
        };
        let output = StuckOutput {
            entered: entered_tx,
            unstick: unstick_rx,
            log: Arc::clone(&log),
        };
        let sink = StreamingAudioSink::new(&config, Arc::new(output));
        assert!(sink.start());
        sink.push(AudioChunk::new(vec![0.3; 8])).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let t0 = Instant::now();
        sink.release();
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(150), "returned after {waited:?}");
        assert!(waited < Duration::from_secs(2), "returned after {waited:?}");
        assert_eq!(log.closes.load(Ordering::SeqCst), 0);

        // Once the device lets go, the detached thread still shuts down cleanly.
        drop(unstick_tx);
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!sink.is_running());
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wav_export_writes_pcm16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav(&path, &[0.0, 0.5, -1.0, 2.0], 24000).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16384, -32767, 32767]);
    }

    #[test]
    fn release_without_start_is_safe() {
        let (sink, log) = sink_with_capacity(4);
        sink.push(AudioChunk::new(vec![0.1])).unwrap();
        sink.release();
        assert_eq!(sink.queued_len(), 0);
        assert_eq!(log.closes.load(Ordering::SeqCst), 0);
    }
}
