//! Kokoro engine binding: text → phonemes → ONNX inference → f32 audio.
//!
//! Pipeline per `submit`:
//! 1. Text → sentences (terminal punctuation or line breaks)
//! 2. Sentence → phoneme token IDs (misaki-rs G2P + tokenizer.json), cached
//!    per sentence until `reset`
//! 3. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//! 4. Audio → registered callback, one call per sentence

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::binding::{AudioCallback, NativeEngineBinding, NativeHandle};

pub const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension
const STYLE_DIM: usize = 256;
/// Boundary token placed before and after every phoneme sequence.
const PAD: i64 = 0;
const TOKEN_CACHE_LIMIT: usize = 256;

/// File names inside the model directory, read from the engine config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct KokoroManifest {
    model: String,
    voices: String,
    tokenizer: String,
}

impl Default for KokoroManifest {
    fn default() -> Self {
        Self {
            model: "kokoro-v1.0.onnx".into(),
            voices: "voices-v1.0.bin".into(),
            tokenizer: "tokenizer.json".into(),
        }
    }
}

impl KokoroManifest {
    fn read(config_path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read engine config: {e}"))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents).map_err(|e| format!("Failed to parse engine config: {e}"))
    }
}

/// Style vectors indexed by token count, shape (510, 256).
struct VoiceData {
    styles: Array2<f32>,
}

impl VoiceData {
    /// Style row for a framed sequence of `n_tokens` (pads included).
    fn style_for(&self, n_tokens: usize) -> Vec<f32> {
        let row = n_tokens.saturating_sub(2).min(self.styles.nrows().saturating_sub(1));
        self.styles.row(row).to_vec()
    }
}

/// Token IDs of sentences already phonemized, reused when a sentence repeats.
#[derive(Default)]
struct TokenCache {
    entries: HashMap<String, Vec<i64>>,
}

impl TokenCache {
    fn get(&self, sentence: &str) -> Option<Vec<i64>> {
        self.entries.get(sentence).cloned()
    }

    fn insert(&mut self, sentence: &str, ids: Vec<i64>) {
        if self.entries.len() >= TOKEN_CACHE_LIMIT {
            self.entries.clear();
        }
        self.entries.insert(sentence.to_string(), ids);
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}

/// Creates Kokoro engine instances.
pub struct KokoroBinding {
    threads: usize,
}

impl KokoroBinding {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

impl NativeEngineBinding for KokoroBinding {
    /// Load the ONNX model, tokenizer, voices, and phonemizer.
    fn load(&self, config_path: &Path) -> Result<Box<dyn NativeHandle>, String> {
        let t0 = Instant::now();
        let manifest = KokoroManifest::read(config_path)?;
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let tokenizer_path = base_dir.join(&manifest.tokenizer);
        info!("Loading tokenizer from {}", tokenizer_path.display());
        let vocab = load_tokenizer(&tokenizer_path)?;
        info!("Tokenizer loaded: {} tokens", vocab.len());

        let voices_path = base_dir.join(&manifest.voices);
        info!("Loading voices from {}", voices_path.display());
        let voices = load_voices(&voices_path)?;
        info!("Loaded {} voices", voices.len());

        let model_path = base_dir.join(&manifest.model);
        info!("Loading ONNX model from {}", model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| format!("Failed to create ONNX session builder: {e}"))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| format!("Failed to set optimization level: {e}"))?
            .with_intra_threads(self.threads)
            .map_err(|e| format!("Failed to set thread count: {e}"))?
            .commit_from_file(&model_path)
            .map_err(|e| format!("Failed to load ONNX model: {e}"))?;

        info!("Initializing misaki-rs phonemizer...");
        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        info!("Kokoro engine loaded in {}ms", t0.elapsed().as_millis());

        Ok(Box::new(KokoroHandle {
            session,
            phonemizer,
            vocab,
            voices,
            voice: "af_heart".into(),
            speed: 1.0,
            max_tokens: MAX_TOKENS,
            audio_enabled: true,
            audio: None,
            cache: TokenCache::default(),
        }))
    }
}

struct KokoroHandle {
    session: ort::session::Session,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    voices: HashMap<String, VoiceData>,
    voice: String,
    speed: f32,
    max_tokens: usize,
    audio_enabled: bool,
    audio: Option<AudioCallback>,
    cache: TokenCache,
}

impl KokoroHandle {
    /// Phoneme token IDs for one sentence, without boundary pads.
    fn tokenize(&mut self, sentence: &str) -> Result<Vec<i64>, String> {
        if let Some(ids) = self.cache.get(sentence) {
            debug!("Token cache hit: {} ids", ids.len());
            return Ok(ids);
        }
        let (phonemes, _) = self
            .phonemizer
            .g2p(sentence)
            .map_err(|e| format!("Phonemization failed: {e}"))?;
        let ids: Vec<i64> = phonemes
            .chars()
            .filter_map(|ch| self.vocab.get(&ch).copied())
            .collect();
        self.cache.insert(sentence, ids.clone());
        Ok(ids)
    }

    /// Run the model over one framed token sequence.
    fn synthesize(&mut self, tokens: Vec<i64>) -> Result<Vec<f32>, String> {
        let voice = self
            .voices
            .get(&self.voice)
            .ok_or_else(|| format!("Voice not found: {}", self.voice))?;
        let n_tokens = tokens.len();
        let style = voice.style_for(n_tokens);

        let tokens = Array2::from_shape_vec((1, n_tokens), tokens)
            .map_err(|e| format!("Bad token shape: {e}"))
            .and_then(|a| Tensor::from_array(a).map_err(|e| format!("Token tensor: {e}")))?;
        let style = Array2::from_shape_vec((1, STYLE_DIM), style)
            .map_err(|e| format!("Bad style shape: {e}"))
            .and_then(|a| Tensor::from_array(a).map_err(|e| format!("Style tensor: {e}")))?;
        let speed = Tensor::from_array(ndarray::Array1::from_vec(vec![self.speed]))
            .map_err(|e| format!("Speed tensor: {e}"))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "tokens" => tokens,
                "style" => style,
                "speed" => speed
            ])
            .map_err(|e| format!("ONNX inference failed: {e}"))?;

        // The waveform is the first output.
        let (_, waveform) = outputs
            .iter()
            .next()
            .ok_or("Model produced no output")?;
        let (_, samples) = waveform
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to read waveform: {e}"))?;
        Ok(samples.to_vec())
    }

    /// Sentence → audio. Empty when the sentence has no pronounceable phonemes.
    fn speak_sentence(&mut self, sentence: &str) -> Result<Vec<f32>, String> {
        let ids = self.tokenize(sentence)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let samples = self.synthesize(frame_tokens(&ids, self.max_tokens))?;
        debug!(
            "Synthesized {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }
}

impl NativeHandle for KokoroHandle {
    fn submit(
        &mut self,
        prompt: &str,
        cancel: &AtomicBool,
        on_partial: &mut dyn FnMut(&str),
    ) -> Result<String, String> {
        let sentences = split_sentences(prompt.trim());
        if sentences.is_empty() {
            return Ok(String::new());
        }

        let mut spoken: Vec<&str> = Vec::with_capacity(sentences.len());
        let mut last_error = None;

        for (i, sentence) in sentences.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!("Cancelled before sentence {}/{}", i + 1, sentences.len());
                return Err("generation cancelled".into());
            }

            let t_gen = Instant::now();
            let samples = match self.speak_sentence(sentence) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Generation failed for sentence {}: {e}", i + 1);
                    last_error = Some(e);
                    continue;
                }
            };
            debug!(
                "Sentence {}/{}: gen={:.0}ms",
                i + 1,
                sentences.len(),
                t_gen.elapsed().as_secs_f64() * 1000.0
            );

            if self.audio_enabled && !samples.is_empty() {
                if let Some(audio) = self.audio.as_mut() {
                    audio(samples);
                }
            }
            on_partial(sentence);
            spoken.push(sentence);
        }

        match (spoken.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(spoken.join(" ")),
        }
    }

    fn set_audio_callback(&mut self, callback: Option<AudioCallback>) {
        self.audio = callback;
    }

    fn update_config(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "voice" => {
                if !self.voices.contains_key(value) {
                    return Err(format!("Unknown voice: {value}"));
                }
                self.voice = value.to_string();
                info!("Voice changed to: {value}");
            }
            "speed" => {
                self.speed = value
                    .parse::<f32>()
                    .map_err(|e| format!("Invalid speed {value}: {e}"))?
                    .clamp(0.5, 2.0);
            }
            "max_tokens" => {
                let n = value
                    .parse::<usize>()
                    .map_err(|e| format!("Invalid max_tokens {value}: {e}"))?;
                self.max_tokens = n.clamp(2, MAX_TOKENS);
            }
            "audio" => {
                self.audio_enabled = value
                    .parse::<bool>()
                    .map_err(|e| format!("Invalid audio flag {value}: {e}"))?;
            }
            "precision" => {
                if value != "fp32" {
                    return Err(format!("Unsupported precision: {value}"));
                }
            }
            // Fixed when the ONNX session is built.
            "threads" => debug!("Thread count {value} applies at next load"),
            other => return Err(format!("Unknown config key: {other}")),
        }
        Ok(())
    }

    /// Kokoro keeps no conversational context; forget cached phonemes.
    fn reset(&mut self) {
        let n = self.cache.clear();
        debug!("Dropped {n} cached sentences");
    }

    fn release(self: Box<Self>) {
        info!("Releasing Kokoro engine ({} voices)", self.voices.len());
    }
}

// --- Helper functions ---

/// Wrap IDs in boundary pads, truncating the content so the frame fits
/// `max_tokens` with both pads kept.
fn frame_tokens(ids: &[i64], max_tokens: usize) -> Vec<i64> {
    let room = max_tokens.saturating_sub(2);
    let mut framed = Vec::with_capacity(ids.len().min(room) + 2);
    framed.push(PAD);
    framed.extend_from_slice(&ids[..ids.len().min(room)]);
    framed.push(PAD);
    framed
}

#[derive(Deserialize)]
struct TokenizerFile {
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct TokenizerModel {
    vocab: HashMap<String, i64>,
}

/// Phoneme → ID table from a HuggingFace-style tokenizer.json. Only
/// single-character tokens are usable for phoneme strings.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    let file: TokenizerFile = serde_json::from_str(&contents)
        .map_err(|e| format!("Invalid tokenizer {}: {e}", path.display()))?;

    Ok(file
        .model
        .vocab
        .into_iter()
        .filter_map(|(token, id)| {
            let mut chars = token.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => Some((ch, id)),
                _ => None,
            }
        })
        .collect())
}

/// Voice style tables from an NPZ archive, one `<name>.npy` per voice.
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;
    let mut npz = NpzReader::new(file).map_err(|e| format!("Invalid voices archive: {e}"))?;
    let entries = npz
        .names()
        .map_err(|e| format!("Failed to list voices: {e}"))?;

    let mut voices = HashMap::with_capacity(entries.len());
    for entry in entries {
        let raw: Array3<f32> = npz
            .by_name(&entry)
            .map_err(|e| format!("Failed to read voice entry {entry}: {e}"))?;
        let name = entry.trim_end_matches(".npy").to_string();
        voices.insert(name, voice_from_raw(raw).map_err(|e| format!("Voice {entry}: {e}"))?);
    }
    Ok(voices)
}

/// (rows, 1, 256) → (rows, 256).
fn voice_from_raw(raw: Array3<f32>) -> Result<VoiceData, String> {
    let (rows, mid, dim) = raw.dim();
    if mid != 1 || dim != STYLE_DIM || rows == 0 {
        return Err(format!("unexpected style shape ({rows}, {mid}, {dim})"));
    }
    let styles = raw
        .into_shape_with_order((rows, dim))
        .map_err(|e| format!("reshape failed: {e}"))?;
    Ok(VoiceData { styles })
}

/// Sentence boundaries: terminal punctuation followed by whitespace, or a
/// line break.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut rest = text;
    while let Some(end) = sentence_end(rest) {
        let (sentence, tail) = rest.split_at(end);
        let sentence = sentence.trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        rest = tail;
    }
    let tail = rest.trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        let end = i + ch.len_utf8();
        if ch == '\n' {
            return Some(end);
        }
        if matches!(ch, '.' | '!' | '?' | '…')
            && chars.peek().is_some_and(|&(_, next)| next.is_whitespace())
        {
            return Some(end);
        }
    }
    None
}
