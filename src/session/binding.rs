//! Boundary to a native inference engine.
//!
//! The binding creates handles; a handle is the only thing that touches
//! engine memory. `InferenceSession` owns at most one handle and is the
//! only caller of these methods.

use std::path::Path;
use std::sync::atomic::AtomicBool;

/// Receives raw samples (mono, normalized f32) as the engine produces them.
pub type AudioCallback = Box<dyn FnMut(Vec<f32>) + Send>;

pub trait NativeEngineBinding: Send + Sync {
    /// Initialize an engine instance from its config file.
    fn load(&self, config_path: &Path) -> Result<Box<dyn NativeHandle>, String>;
}

pub trait NativeHandle: Send {
    /// Run one generation. `on_partial` is called with each piece of text as
    /// it is finalized. Implementations should return early once `cancel` is set.
    fn submit(
        &mut self,
        prompt: &str,
        cancel: &AtomicBool,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, String>;

    /// Install or clear the audio sink for subsequent `submit` calls.
    fn set_audio_callback(&mut self, callback: Option<AudioCallback>);

    fn update_config(&mut self, key: &str, value: &str) -> Result<(), String>;

    /// Clear conversational history.
    fn reset(&mut self);

    /// Free engine memory. Consumes the handle so it cannot run twice.
    fn release(self: Box<Self>);
}
