use super::SessionHandle;
use crate::config::TtsConfig;
use crate::error::UpstreamError;
use crate::protocol::{ErrorCode, ServerMessage};
use crate::upstream::tts::split_sentences;
use crate::upstream::{TtsChunk, TtsConnector};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const SPEECH_QUEUE_SIZE: usize = 16;

struct Utterance {
    text: String,
    generation: u64,
}

/// Plays utterances one after another, each over its own TTS connection, so
/// audio from two utterances never interleaves.
#[derive(Clone)]
pub struct SpeechQueue {
    tx: mpsc::Sender<Utterance>,
    generation: Arc<AtomicU64>,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

/// Per-session TTS behaviour taken from the `[tts]` config section.
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub default_voice_id: String,
    pub chunk_timeout: Duration,
}

impl From<&TtsConfig> for SpeechSettings {
    fn from(cfg: &TtsConfig) -> Self {
        Self { default_voice_id: cfg.default_voice_id.clone(), chunk_timeout: cfg.chunk_timeout() }
    }
}

impl SpeechQueue {
    pub fn spawn(
        handle: SessionHandle,
        tts: Arc<dyn TtsConnector>,
        voice_id: String,
        settings: SpeechSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Utterance>(SPEECH_QUEUE_SIZE);
        let generation = Arc::new(AtomicU64::new(0));
        let current: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let this = Self { tx, generation: generation.clone(), current: current.clone() };
        let cancel = handle.cancel_token();
        let task = tokio::spawn(async move {
            let mut voice_id = voice_id;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    u = rx.recv() => u,
                };
                let Some(u) = next else { break };
                let token = {
                    // same lock as interrupt(), so a stale utterance can never start
                    let mut cur = current.lock();
                    if u.generation != generation.load(Ordering::SeqCst) { continue; }
                    let token = cancel.child_token();
                    *cur = Some(token.clone());
                    token
                };
                let player = Player { handle: &handle, tts: tts.as_ref(), current: &current, chunk_timeout: settings.chunk_timeout };
                let spoken = player.speak(&voice_id, &u.text, &token).await;
                match spoken {
                    Ok(()) => {}
                    Err(UpstreamError::NoSuchVoice(missing)) if voice_id != settings.default_voice_id => {
                        warn!(
                            session_id = %handle.id(),
                            voice_id = %missing,
                            fallback = %settings.default_voice_id,
                            "unknown voice; switching to default voice"
                        );
                        report(&handle, UpstreamError::NoSuchVoice(missing)).await;
                        voice_id = settings.default_voice_id.clone();
                        if let Err(e) = player.speak(&voice_id, &u.text, &token).await {
                            report(&handle, e).await;
                        }
                    }
                    Err(e) => report(&handle, e).await,
                }
                *current.lock() = None;
            }
        });
        (this, task)
    }

    pub async fn say(&self, text: String) {
        let generation = self.generation.load(Ordering::SeqCst);
        if self.tx.send(Utterance { text, generation }).await.is_err() {
            debug!("speech queue closed; utterance dropped");
        }
    }

    /// Stops the utterance in flight and discards queued ones. Returns true if
    /// something was playing.
    pub fn interrupt(&self) -> bool {
        let mut cur = self.current.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        match cur.take() {
            Some(token) => { token.cancel(); true }
            None => false,
        }
    }
}

struct Player<'a> {
    handle: &'a SessionHandle,
    tts: &'a dyn TtsConnector,
    current: &'a Mutex<Option<CancellationToken>>,
    chunk_timeout: Duration,
}

impl Player<'_> {
    /// Streams one utterance to the client. Cancellation is not an error.
    async fn speak(&self, voice_id: &str, text: &str, token: &CancellationToken) -> Result<(), UpstreamError> {
        let opened = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            r = self.tts.open(voice_id) => r,
        };
        let mut stream = opened?;
        for piece in split_sentences(text) {
            if stream.send_text(piece).await.is_err() { break; }
        }
        if let Err(e) = stream.finish().await {
            debug!(session_id = %self.handle.id(), error = %e, "end-of-stream not sent");
        }
        let mut outcome = Ok(());
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => break,
                c = tokio::time::timeout(self.chunk_timeout, stream.recv()) => c,
            };
            let Ok(chunk) = chunk else {
                outcome = Err(UpstreamError::Timeout(self.chunk_timeout));
                break;
            };
            match chunk {
                Some(Ok(TtsChunk::Audio(bytes))) => {
                    // pushed under the interrupt lock so a flush after interrupt() sees every chunk
                    let _cur = self.current.lock();
                    if token.is_cancelled() { break; }
                    self.handle.send_audio(bytes);
                }
                Some(Ok(TtsChunk::StartOfStream)) => debug!(session_id = %self.handle.id(), "tts streaming"),
                Some(Ok(TtsChunk::EndOfStream)) | None => break,
                Some(Err(e)) => { outcome = Err(e); break; }
            }
        }
        stream.close().await;
        outcome
    }
}

async fn report(handle: &SessionHandle, e: UpstreamError) {
    warn!(session_id = %handle.id(), error = %e, "tts utterance failed");
    let code = match e {
        UpstreamError::NoSuchVoice(_) => ErrorCode::NoSuchVoice,
        _ => ErrorCode::TtsFailed,
    };
    handle.send(ServerMessage::error(code, e.to_string())).await;
}
