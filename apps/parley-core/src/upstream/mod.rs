//! Outbound connections: the live conversational service (one per session) and
//! the streaming TTS backend (one per utterance).

pub mod live;
pub mod tts;

use crate::error::UpstreamError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LIVE_EVENT_CHANNEL_SIZE: usize = 64;
pub const LIVE_INPUT_CHANNEL_SIZE: usize = 32;
pub const TTS_CHUNK_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamTurnEvent {
    PartialTranscript(String),
    ToolCall { id: Option<String>, name: String, args: Value },
    FunctionResult { id: Option<String>, payload: Value },
    Interrupted,
    TurnComplete,
    Error(UpstreamError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveInput {
    Audio(Vec<u8>),
    Text(String),
    ToolOutput { id: Option<String>, name: String, output: Value },
}

#[derive(Debug, Clone)]
pub struct LiveSessionParams {
    pub session_id: String,
    pub instructions: String,
    pub voice: Option<String>,
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TtsChunk {
    StartOfStream,
    Audio(Vec<u8>),
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TtsInput {
    Text(String),
    /// Sends the end-of-stream sentinel.
    Finish,
}

/// Cloneable write half of a live connection.
#[derive(Clone)]
pub struct LiveSender(mpsc::Sender<LiveInput>);

impl LiveSender {
    pub async fn send(&self, input: LiveInput) -> Result<(), UpstreamError> {
        self.0.send(input).await.map_err(|_| UpstreamError::Closed)
    }
}

/// An opened live connection. `ready` completes once when the service has
/// accepted the session configuration; `events` ends when the remote closes.
pub struct LiveConnection {
    pub ready: oneshot::Receiver<()>,
    pub events: mpsc::Receiver<UpstreamTurnEvent>,
    input: mpsc::Sender<LiveInput>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveConnection {
    pub fn new(
        ready: oneshot::Receiver<()>,
        events: mpsc::Receiver<UpstreamTurnEvent>,
        input: mpsc::Sender<LiveInput>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { ready, events, input, cancel, task }
    }

    pub fn sender(&self) -> LiveSender { LiveSender(self.input.clone()) }

    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() { let _ = task.await; }
    }
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn open(&self, params: LiveSessionParams) -> Result<LiveConnection, UpstreamError>;
}

/// One utterance worth of TTS connection.
pub struct TtsStream {
    input: mpsc::Sender<TtsInput>,
    chunks: mpsc::Receiver<Result<TtsChunk, UpstreamError>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TtsStream {
    pub fn new(
        input: mpsc::Sender<TtsInput>,
        chunks: mpsc::Receiver<Result<TtsChunk, UpstreamError>>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { input, chunks, cancel, task }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), UpstreamError> {
        self.input.send(TtsInput::Text(text.into())).await.map_err(|_| UpstreamError::Closed)
    }

    pub async fn finish(&self) -> Result<(), UpstreamError> {
        self.input.send(TtsInput::Finish).await.map_err(|_| UpstreamError::Closed)
    }

    /// `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<TtsChunk, UpstreamError>> { self.chunks.recv().await }

    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() { let _ = task.await; }
    }
}

#[async_trait]
pub trait TtsConnector: Send + Sync {
    async fn open(&self, voice_id: &str) -> Result<TtsStream, UpstreamError>;
}
