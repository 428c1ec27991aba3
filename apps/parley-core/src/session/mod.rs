pub mod coordinator;
pub mod idle;
pub mod queue;
pub mod registry;
pub mod speech;

use crate::protocol::ServerMessage;
use parking_lot::Mutex;
use queue::DropOldest;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use coordinator::{RelayServices, SessionCoordinator, SessionParams};
pub use registry::SessionRegistry;

pub const CONTROL_CHANNEL_SIZE: usize = 32;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Ready,
    Active,
    Closing,
    Closed,
}

/// Frames bound for the client socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Audio(Vec<u8>),
    Close { code: u16, reason: String },
}

struct SessionInner {
    id: String,
    character_id: i64,
    owner_id: i64,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    cancel: CancellationToken,
    control_tx: mpsc::Sender<Outbound>,
    audio_out: Arc<DropOldest<Vec<u8>>>,
}

/// Shared reference to one live session. The registry and the idle monitor hold
/// clones; the coordinator owns the tasks behind it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn new(id: String, character_id: i64, owner_id: i64, outbound_audio: usize) -> (Self, OutboundReceiver) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let audio_out = Arc::new(DropOldest::new(outbound_audio));
        let cancel = CancellationToken::new();
        let handle = Self {
            inner: Arc::new(SessionInner {
                id,
                character_id,
                owner_id,
                state: Mutex::new(SessionState::Connecting),
                closed: AtomicBool::new(false),
                cancel: cancel.clone(),
                control_tx,
                audio_out: audio_out.clone(),
            }),
        };
        let rx = OutboundReceiver { control_rx, audio: audio_out, cancel, done: false };
        (handle, rx)
    }

    pub fn id(&self) -> &str { &self.inner.id }
    pub fn character_id(&self) -> i64 { self.inner.character_id }
    pub fn owner_id(&self) -> i64 { self.inner.owner_id }
    pub fn state(&self) -> SessionState { *self.inner.state.lock() }
    pub fn cancel_token(&self) -> CancellationToken { self.inner.cancel.clone() }
    pub fn is_closed(&self) -> bool { self.inner.closed.load(Ordering::SeqCst) }

    /// Moves forward only; a closing session never reopens.
    pub fn set_state(&self, next: SessionState) {
        let mut g = self.inner.state.lock();
        if next > *g {
            debug!(session_id = %self.inner.id, from = ?*g, to = ?next, "session state");
            *g = next;
        }
    }

    /// Queues a control message, waiting for a slot. Dropped silently once the session is closed.
    pub async fn send(&self, msg: ServerMessage) {
        if self.is_closed() { return; }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = self.inner.control_tx.send(Outbound::Text(msg.to_json())) => {}
        }
    }

    pub fn send_audio(&self, chunk: Vec<u8>) {
        let before = self.inner.audio_out.dropped();
        self.inner.audio_out.push(chunk);
        parley_telemetry::add_dropped_frames("outbound", self.inner.audio_out.dropped() - before);
    }

    /// Drops outbound audio not yet written to the socket.
    pub fn flush_audio(&self) -> usize { self.inner.audio_out.clear() }

    /// First call wins: queues the close frame, cancels every session task and
    /// returns true. Later calls are no-ops returning false.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self.inner.closed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }
        self.set_state(SessionState::Closing);
        info!(session_id = %self.inner.id, code, reason, "closing session");
        let _ = self.inner.control_tx.try_send(Outbound::Close { code, reason: reason.to_string() });
        self.inner.cancel.cancel();
        self.inner.audio_out.close();
        parley_telemetry::inc_session(&format!("closed:{}", reason.replace(' ', "_")));
        true
    }
}

/// Client-writer side of a session. Control frames go first; after the session is
/// cancelled only the already-queued control frames (ending with the close) are yielded.
pub struct OutboundReceiver {
    control_rx: mpsc::Receiver<Outbound>,
    audio: Arc<DropOldest<Vec<u8>>>,
    cancel: CancellationToken,
    done: bool,
}

impl OutboundReceiver {
    pub async fn next(&mut self) -> Option<Outbound> {
        if self.done { return None; }
        let out = tokio::select! {
            biased;
            m = self.control_rx.recv() => m,
            _ = self.cancel.cancelled() => self.control_rx.try_recv().ok(),
            a = self.audio.pop() => a.map(Outbound::Audio),
        };
        match &out {
            Some(Outbound::Close { .. }) | None => self.done = true,
            _ => {}
        }
        out
    }
}
