//! In-memory engine binding for tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::binding::{AudioCallback, NativeEngineBinding, NativeHandle};

/// One-shot gate a test thread can wait on.
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

#[derive(Clone)]
pub enum SubmitBehavior {
    /// Echo the prompt word by word, one audio chunk per word.
    Echo,
    Fail(String),
    /// Emit one audio chunk, then fail.
    FailMidStream(String),
    Panic,
    /// Signal `started`, wait for `proceed`, then echo.
    Block {
        started: Arc<Latch>,
        proceed: Arc<Latch>,
    },
}

#[derive(Default)]
pub struct Counters {
    pub loads: AtomicUsize,
    pub submits: AtomicUsize,
    pub resets: AtomicUsize,
    pub releases: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub updates: Mutex<Vec<(String, String)>>,
}

#[derive(Clone)]
pub struct FakeBinding {
    pub counters: Arc<Counters>,
    fail_load: bool,
    behavior: Arc<Mutex<SubmitBehavior>>,
}

impl Default for FakeBinding {
    fn default() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            fail_load: false,
            behavior: Arc::new(Mutex::new(SubmitBehavior::Echo)),
        }
    }
}

impl FakeBinding {
    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, behavior: SubmitBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

impl NativeEngineBinding for FakeBinding {
    fn load(&self, _config_path: &Path) -> Result<Box<dyn NativeHandle>, String> {
        if self.fail_load {
            return Err("weights are corrupt".into());
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            counters: Arc::clone(&self.counters),
            behavior: Arc::clone(&self.behavior),
            audio: None,
        }))
    }
}

struct FakeHandle {
    counters: Arc<Counters>,
    behavior: Arc<Mutex<SubmitBehavior>>,
    audio: Option<AudioCallback>,
}

impl FakeHandle {
    fn echo(
        &mut self,
        prompt: &str,
        cancel: &AtomicBool,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, String> {
        for word in prompt.split_whitespace() {
            if cancel.load(Ordering::SeqCst) {
                self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err("cancelled".into());
            }
            on_partial(word);
            if let Some(audio) = self.audio.as_mut() {
                audio(vec![0.25; 4]);
            }
        }
        Ok(prompt.to_string())
    }
}

impl NativeHandle for FakeHandle {
    fn submit(
        &mut self,
        prompt: &str,
        cancel: &AtomicBool,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, String> {
        self.counters.submits.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            SubmitBehavior::Echo => self.echo(prompt, cancel, on_partial),
            SubmitBehavior::Fail(message) => Err(message),
            SubmitBehavior::FailMidStream(message) => {
                if let Some(audio) = self.audio.as_mut() {
                    audio(vec![0.5; 4]);
                }
                Err(message)
            }
            SubmitBehavior::Panic => panic!("engine crashed"),
            SubmitBehavior::Block { started, proceed } => {
                started.open();
                proceed.wait();
                self.echo(prompt, cancel, on_partial)
            }
        }
    }

    fn set_audio_callback(&mut self, callback: Option<AudioCallback>) {
        self.audio = callback;
    }

    fn update_config(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.counters
            .updates
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn reset(&mut self) {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn release(self: Box<Self>) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}
