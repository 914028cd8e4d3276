//! Playback device boundary and the rodio implementation.
//!
//! A device is opened on the sink's consumer thread and never leaves it,
//! so implementations do not need to be `Send` (audio streams are not on
//! every platform).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, info, warn};

/// Opens playback devices. Shared with the consumer thread.
pub trait AudioOutput: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackDevice>, String>;
}

pub trait PlaybackDevice {
    /// Queue PCM16 mono samples. May wait for the device to catch up, but
    /// never indefinitely.
    fn write(&mut self, samples: &[i16]) -> Result<(), String>;

    /// Wait (bounded) until everything written so far has been played.
    fn drain(&mut self);

    /// Stop and free the device. Called exactly once by the consumer.
    fn close(&mut self);
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Extra time past the expected play-out before a device counts as stalled.
const STALL_SLACK: Duration = Duration::from_millis(500);

/// Default output device via rodio, which resamples to whatever rate the
/// hardware runs at.
pub struct RodioOutput {
    look_ahead: Duration,
}

impl RodioOutput {
    /// `buffer_ms` is how much audio may be queued ahead of the speaker.
    pub fn new(buffer_ms: u64) -> Self {
        Self {
            look_ahead: Duration::from_millis(buffer_ms.max(20)),
        }
    }
}

impl AudioOutput for RodioOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackDevice>, String> {
        if sample_rate == 0 {
            return Err("invalid playback sample rate 0".into());
        }

        // rodio 0.21: OutputStream is the handle, Sink::connect_new takes &Mixer
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| format!("Failed to open audio output: {e}"))?;
        let sink = Sink::connect_new(stream.mixer());
        info!("Playback stream opened ({sample_rate}Hz mono)");

        Ok(Box::new(RodioDevice {
            stream: Some(stream),
            sink: Some(sink),
            sample_rate,
            look_ahead: self.look_ahead,
            pending: VecDeque::new(),
        }))
    }
}

struct RodioDevice {
    stream: Option<OutputStream>,
    sink: Option<Sink>,
    sample_rate: u32,
    look_ahead: Duration,
    /// Durations of appended buffers rodio has not finished, oldest first.
    pending: VecDeque<Duration>,
}

impl RodioDevice {
    /// Audio still queued in rodio.
    fn queued(&mut self) -> Duration {
        let live = self.sink.as_ref().map_or(0, Sink::len);
        while self.pending.len() > live {
            self.pending.pop_front();
        }
        self.pending.iter().sum()
    }

    /// Poll until `done`, giving up once the queued audio should long have played.
    fn wait_until(&mut self, what: &str, done: impl Fn(&mut Self) -> bool) -> Result<(), String> {
        let limit = self.queued() + STALL_SLACK;
        let t0 = Instant::now();
        while !done(self) {
            if t0.elapsed() > limit {
                return Err(format!(
                    "playback stalled: {what} did not finish within {}ms",
                    limit.as_millis()
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl PlaybackDevice for RodioDevice {
    fn write(&mut self, samples: &[i16]) -> Result<(), String> {
        if self.sink.is_none() {
            return Err("playback device closed".into());
        }
        let look_ahead = self.look_ahead;
        self.wait_until("write", |d| d.queued() <= look_ahead)?;

        let samples: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        let duration = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        if let Some(sink) = &self.sink {
            sink.append(SamplesBuffer::new(1, self.sample_rate, samples));
            self.pending.push_back(duration);
        }
        Ok(())
    }

    fn drain(&mut self) {
        if let Err(e) = self.wait_until("drain", |d| d.sink.as_ref().map_or(true, Sink::empty)) {
            warn!("{e}");
        }
    }

    fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
            self.pending.clear();
            debug!("Playback sink stopped");
        }
        if self.stream.take().is_some() {
            info!("Playback stream closed");
        }
    }
}
