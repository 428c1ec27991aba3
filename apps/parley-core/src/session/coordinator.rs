use super::idle::IdleMonitor;
use super::queue::DropOldest;
use super::speech::{SpeechQueue, SpeechSettings};
use super::{OutboundReceiver, SessionHandle, SessionRegistry, SessionState, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use crate::audio;
use crate::config::SessionConfig;
use crate::memory::context::build_instructions;
use crate::memory::{MemoryConsolidator, TurnPair};
use crate::protocol::{split_emotion_tag, ClientMessage, ErrorCode, ServerMessage, Speaker};
use crate::tools::{self, ToolAction, ToolError};
use crate::upstream::{LiveConnector, LiveInput, LiveSender, LiveSessionParams, TtsConnector, UpstreamTurnEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const TEXT_INPUT_CHANNEL_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub character_id: i64,
    pub owner_id: i64,
    pub voice_id: String,
    pub persona: String,
}

/// Collaborators shared by every session, passed in explicitly.
#[derive(Clone)]
pub struct RelayServices {
    pub registry: SessionRegistry,
    pub live: Arc<dyn LiveConnector>,
    pub tts: Arc<dyn TtsConnector>,
    pub memory: Option<Arc<MemoryConsolidator>>,
    pub session: SessionConfig,
    pub speech: SpeechSettings,
    pub ready_timeout: Duration,
}

/// Owns one client session: its registry entry, idle watchdog, live connection
/// task and speech queue. The caller feeds client frames in and drains the
/// returned `OutboundReceiver` into the client socket.
pub struct SessionCoordinator {
    handle: SessionHandle,
    inbound: Arc<DropOldest<Vec<u8>>>,
    text_tx: mpsc::Sender<String>,
    idle: IdleMonitor,
    silence_threshold: f64,
    registry: SessionRegistry,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionCoordinator {
    pub fn start(services: &RelayServices, params: SessionParams) -> (Self, OutboundReceiver) {
        let cfg = &services.session;
        let id = uuid::Uuid::new_v4().to_string();
        let (handle, outbound) = SessionHandle::new(id, params.character_id, params.owner_id, cfg.outbound_audio_buffer);
        services.registry.register(handle.clone());
        parley_telemetry::inc_session("opened");
        info!(session_id = %handle.id(), character_id = params.character_id, owner_id = params.owner_id, "session started");

        let inbound = Arc::new(DropOldest::new(cfg.inbound_buffer));
        let (text_tx, text_rx) = mpsc::channel(TEXT_INPUT_CHANNEL_SIZE);
        let on_idle = handle.clone();
        let (idle, idle_task) = IdleMonitor::spawn(cfg.idle_timeout(), handle.cancel_token(), move || {
            on_idle.close(CLOSE_NORMAL, "idle timeout");
        });
        let (speech, speech_task) = SpeechQueue::spawn(
            handle.clone(),
            services.tts.clone(),
            params.voice_id.clone(),
            services.speech.clone(),
        );

        handle.set_state(SessionState::Ready);
        let live_task = tokio::spawn(run_live(LiveTask {
            handle: handle.clone(),
            live: services.live.clone(),
            memory: services.memory.clone(),
            params,
            ready_timeout: services.ready_timeout,
            inbound: inbound.clone(),
            text_rx,
            speech,
        }));

        let this = Self {
            handle,
            inbound,
            text_tx,
            idle,
            silence_threshold: cfg.silence_threshold,
            registry: services.registry.clone(),
            tasks: vec![live_task, speech_task, idle_task],
        };
        (this, outbound)
    }

    pub fn handle(&self) -> &SessionHandle { &self.handle }

    /// Buffers a client audio frame for the live service. Non-silent frames keep the session alive.
    pub fn on_client_audio(&self, frame: Vec<u8>) {
        if self.handle.is_closed() { return; }
        if !audio::is_silence(&frame, self.silence_threshold) { self.idle.touch(); }
        let before = self.inbound.dropped();
        self.inbound.push(frame);
        parley_telemetry::add_dropped_frames("inbound", self.inbound.dropped() - before);
    }

    pub async fn on_client_text(&self, raw: &str) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(ClientMessage::TextMessage { text }) => {
                self.idle.touch();
                if self.text_tx.send(text).await.is_err() {
                    debug!(session_id = %self.handle.id(), "text input after live task ended");
                }
            }
            Err(e) => warn!(session_id = %self.handle.id(), error = %e, "ignoring malformed client message"),
        }
    }

    /// Closes (if nobody has yet), waits for every session task and unregisters.
    pub async fn shutdown(mut self, reason: &str) {
        self.handle.close(CLOSE_NORMAL, reason);
        self.inbound.close();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(session_id = %self.handle.id(), error = %e, "session task panicked");
            }
        }
        self.registry.unregister(self.handle.id());
        self.handle.set_state(SessionState::Closed);
        info!(session_id = %self.handle.id(), "session closed");
    }
}

struct LiveTask {
    handle: SessionHandle,
    live: Arc<dyn LiveConnector>,
    memory: Option<Arc<MemoryConsolidator>>,
    params: SessionParams,
    ready_timeout: Duration,
    inbound: Arc<DropOldest<Vec<u8>>>,
    text_rx: mpsc::Receiver<String>,
    speech: SpeechQueue,
}

async fn fail(handle: &SessionHandle, code: ErrorCode, message: String) {
    warn!(session_id = %handle.id(), code = %code.code(), %message, "live upstream failed");
    handle.send(ServerMessage::error(code, message)).await;
    handle.close(CLOSE_INTERNAL_ERROR, "upstream error");
}

async fn run_live(t: LiveTask) {
    let handle = t.handle;
    let cancel = handle.cancel_token();
    let deadline = Instant::now() + t.ready_timeout;

    let instructions = match &t.memory {
        Some(memory) => match memory.session_context(t.params.owner_id, t.params.character_id).await {
            Ok((short, mid)) => build_instructions(&t.params.persona, short.as_ref(), &mid),
            Err(e) => {
                warn!(session_id = %handle.id(), error = %e, "memory context unavailable");
                build_instructions(&t.params.persona, None, &[])
            }
        },
        None => build_instructions(&t.params.persona, None, &[]),
    };
    let live_params = LiveSessionParams {
        session_id: handle.id().to_string(),
        instructions,
        voice: None,
        tools: tools::tool_declarations(),
    };

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        r = tokio::time::timeout_at(deadline, t.live.open(live_params)) => r,
    };
    let mut conn = match opened {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return fail(&handle, ErrorCode::LiveUnavailable, e.to_string()).await,
        Err(_) => return fail(&handle, ErrorCode::LiveReadyTimeout, format!("live service not ready within {:?}", t.ready_timeout)).await,
    };

    let ready = tokio::select! {
        _ = cancel.cancelled() => { conn.close().await; return; }
        r = tokio::time::timeout_at(deadline, &mut conn.ready) => r,
    };
    match ready {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            fail(&handle, ErrorCode::LiveUnavailable, "live connection ended before it was ready".into()).await;
            conn.close().await;
            return;
        }
        Err(_) => {
            fail(&handle, ErrorCode::LiveReadyTimeout, format!("live service not ready within {:?}", t.ready_timeout)).await;
            conn.close().await;
            return;
        }
    }

    handle.set_state(SessionState::Active);
    handle.send(ServerMessage::ServerReady { session_id: handle.id().to_string() }).await;
    info!(session_id = %handle.id(), buffered = t.inbound.len(), dropped = t.inbound.dropped(), "live service ready");

    let sender = conn.sender();
    let pump = tokio::spawn(pump_input(handle.clone(), t.inbound, t.text_rx, sender.clone()));
    let ctx = Dispatch { handle: handle.clone(), sender, speech: t.speech, memory: t.memory, params: t.params };
    let mut turn = TurnBuffer::default();
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = conn.events.recv() => ev,
        };
        match ev {
            Some(ev) => {
                if dispatch(&ctx, &mut turn, ev).await == Flow::Stop { break; }
            }
            None => {
                if turn.upstream_failed {
                    handle.close(CLOSE_INTERNAL_ERROR, "upstream error");
                } else {
                    handle.close(CLOSE_NORMAL, "upstream closed");
                }
                break;
            }
        }
    }
    conn.close().await;
    let _ = pump.await;
}

/// Drains buffered client audio and text into the live connection, in arrival order.
async fn pump_input(handle: SessionHandle, inbound: Arc<DropOldest<Vec<u8>>>, mut text_rx: mpsc::Receiver<String>, sender: LiveSender) {
    let cancel = handle.cancel_token();
    loop {
        let input = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(text) = text_rx.recv() => LiveInput::Text(text),
            frame = inbound.pop() => match frame {
                Some(frame) => LiveInput::Audio(frame),
                None => break,
            },
        };
        if let Err(e) = sender.send(input).await {
            fail(&handle, ErrorCode::LiveFailed, format!("sending to live service: {e}")).await;
            break;
        }
    }
}

#[derive(Default)]
struct TurnBuffer {
    input: String,
    output: String,
    upstream_failed: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Dispatch {
    handle: SessionHandle,
    sender: LiveSender,
    speech: SpeechQueue,
    memory: Option<Arc<MemoryConsolidator>>,
    params: SessionParams,
}

async fn dispatch(ctx: &Dispatch, turn: &mut TurnBuffer, ev: UpstreamTurnEvent) -> Flow {
    match ev {
        UpstreamTurnEvent::PartialTranscript(text) => {
            let (emotion, rest) = split_emotion_tag(&text);
            if let Some(emotion) = emotion {
                ctx.handle.send(ServerMessage::Emotion { emotion }).await;
            }
            if !rest.is_empty() {
                turn.input.push_str(rest);
                ctx.handle.send(ServerMessage::Subtitle { speaker: Speaker::User, text: rest.to_string() }).await;
            }
            Flow::Continue
        }
        UpstreamTurnEvent::ToolCall { id, name, args } => handle_tool(ctx, turn, id, name, args).await,
        UpstreamTurnEvent::FunctionResult { id, payload } => {
            match payload.as_str().or_else(|| payload.get("text").and_then(|t| t.as_str())) {
                Some(text) => say(ctx, turn, text).await,
                None => debug!(session_id = %ctx.handle.id(), ?id, "function result without text"),
            }
            Flow::Continue
        }
        UpstreamTurnEvent::Interrupted => {
            let was_playing = ctx.speech.interrupt();
            let flushed = ctx.handle.flush_audio();
            debug!(session_id = %ctx.handle.id(), was_playing, flushed, "turn interrupted");
            ctx.handle.send(ServerMessage::Interrupted).await;
            Flow::Continue
        }
        UpstreamTurnEvent::TurnComplete => {
            finish_turn(ctx, turn).await;
            Flow::Continue
        }
        UpstreamTurnEvent::Error(e) => {
            warn!(session_id = %ctx.handle.id(), error = %e, "live service reported an error");
            turn.upstream_failed = true;
            ctx.handle.send(ServerMessage::error(ErrorCode::LiveFailed, e.to_string())).await;
            Flow::Continue
        }
    }
}

async fn say(ctx: &Dispatch, turn: &mut TurnBuffer, text: &str) {
    let (emotion, rest) = split_emotion_tag(text);
    if let Some(emotion) = emotion {
        ctx.handle.send(ServerMessage::Emotion { emotion }).await;
    }
    if rest.is_empty() { return; }
    if !turn.output.is_empty() { turn.output.push(' '); }
    turn.output.push_str(rest);
    ctx.handle.send(ServerMessage::Subtitle { speaker: Speaker::Bot, text: rest.to_string() }).await;
    ctx.speech.say(rest.to_string()).await;
}

async fn handle_tool(ctx: &Dispatch, turn: &mut TurnBuffer, id: Option<String>, name: String, args: Value) -> Flow {
    let action = match tools::resolve(&name, &args) {
        Ok(action) => action,
        Err(ToolError::Unknown(n)) => {
            warn!(session_id = %ctx.handle.id(), tool = %n, "unknown tool call dropped");
            parley_telemetry::inc_tool_call(&n, "unknown");
            return Flow::Continue;
        }
        Err(e) => {
            error!(session_id = %ctx.handle.id(), error = %e, "tool call dropped");
            parley_telemetry::inc_tool_call(&name, "bad_arguments");
            return Flow::Continue;
        }
    };
    parley_telemetry::inc_tool_call(&name, "ok");
    match action {
        ToolAction::Speak { text } => {
            say(ctx, turn, &text).await;
            ack(ctx, id, name, json!({"ok": true})).await
        }
        ToolAction::Emotion(emotion) => {
            ctx.handle.send(ServerMessage::Emotion { emotion }).await;
            ack(ctx, id, name, json!({"ok": true})).await
        }
        ToolAction::SearchMemory { query } => {
            let Some(memory) = ctx.memory.clone() else {
                return ack(ctx, id, name, json!({"memories": ""})).await;
            };
            // lookups embed the query, which may retry for seconds; keep events flowing meanwhile
            let sender = ctx.sender.clone();
            let handle = ctx.handle.clone();
            let (owner, character) = (ctx.params.owner_id, ctx.params.character_id);
            let cancel = handle.cancel_token();
            tokio::spawn(async move {
                let k = memory.settings().long_term_k;
                let found = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = memory.search(owner, character, &query, k) => r,
                };
                let memories = match found {
                    Ok(hits) => hits.into_iter().map(|h| h.record.summary).collect::<Vec<_>>().join("\n"),
                    Err(e) => {
                        warn!(session_id = %handle.id(), error = %e, "memory search failed");
                        String::new()
                    }
                };
                if let Err(e) = sender.send(LiveInput::ToolOutput { id, name, output: json!({"memories": memories}) }).await {
                    debug!(session_id = %handle.id(), error = %e, "memory result not delivered");
                }
            });
            Flow::Continue
        }
        ToolAction::EndCall => {
            if ack(ctx, id, name, json!({"ok": true})).await == Flow::Continue {
                ctx.handle.close(CLOSE_NORMAL, "end call");
            }
            Flow::Stop
        }
    }
}

async fn ack(ctx: &Dispatch, id: Option<String>, name: String, output: Value) -> Flow {
    match ctx.sender.send(LiveInput::ToolOutput { id, name, output }).await {
        Ok(()) => Flow::Continue,
        Err(e) => {
            fail(&ctx.handle, ErrorCode::LiveFailed, format!("sending tool output: {e}")).await;
            Flow::Stop
        }
    }
}

async fn finish_turn(ctx: &Dispatch, turn: &mut TurnBuffer) {
    let input = std::mem::take(&mut turn.input).trim().to_string();
    let output = std::mem::take(&mut turn.output).trim().to_string();
    if input.is_empty() && output.is_empty() { return; }
    ctx.handle.send(ServerMessage::TurnComplete { input: input.clone(), output: output.clone() }).await;
    // a pair needs both halves to be worth remembering
    if input.is_empty() || output.is_empty() { return; }
    if let Some(memory) = ctx.memory.clone() {
        let (owner, character) = (ctx.params.owner_id, ctx.params.character_id);
        let session_id = ctx.handle.id().to_string();
        // not tied to the session scope: a turn that completed is saved even if the client leaves
        tokio::spawn(async move {
            match memory.save(owner, character, &TurnPair::now(input, output)).await {
                Ok(outcome) => debug!(%session_id, ?outcome, "turn saved"),
                Err(e) => error!(%session_id, error = %e, "saving turn failed"),
            }
        });
    }
}
