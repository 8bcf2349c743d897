use crate::events::StreamEvent;
use crate::reconciler::HistoryReconciler;
use crate::render::{AudioPlayer, BufferRenderer};
use crate::stores::{HistoryStore, InMemoryHistory, UserAnchor};
use crate::transport::{EventStream, StreamRequest, TurnTransport};
use crate::types::{ChatId, ClientConfig, Message, MessageTimestamp, Role};
use anyhow::{Result, anyhow, bail};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::TurnController;

// ===================
// Scripted backend
// ===================

pub enum Step {
    Event(StreamEvent),
    /// Block until the gate is opened.
    Wait(Arc<Notify>),
    /// Signal that the stream got this far.
    Reached(Arc<Notify>),
    /// Fail the stream with a transport error.
    Fail(String),
}

#[derive(Default)]
pub struct Script {
    open_error: Option<String>,
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            steps: Vec::new(),
        }
    }

    pub fn event(mut self, event: StreamEvent) -> Self {
        self.steps.push(Step::Event(event));
        self
    }

    pub fn started(self) -> Self {
        self.event(StreamEvent::StreamStarted)
    }

    pub fn delta(self, text: &str) -> Self {
        self.event(StreamEvent::delta(text))
    }

    pub fn done(self, ephemeral: bool) -> Self {
        self.event(StreamEvent::done(ephemeral))
    }

    pub fn wait(mut self, gate: &Arc<Notify>) -> Self {
        self.steps.push(Step::Wait(Arc::clone(gate)));
        self
    }

    pub fn reached(mut self, signal: &Arc<Notify>) -> Self {
        self.steps.push(Step::Reached(Arc::clone(signal)));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }

    /// `stream_started`, one delta per fragment, `done(false)`.
    pub fn reply(fragments: &[&str]) -> Self {
        fragments
            .iter()
            .fold(Self::new().started(), |script, text| script.delta(text))
            .done(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteCall {
    FromUser(UserAnchor),
    FromAssistant(MessageTimestamp),
    AssistantMessage(MessageTimestamp),
}

/// Plays back queued scripts and persists completed turns into an
/// in-memory history the way the server would.
pub struct MockBackend {
    history: Arc<InMemoryHistory>,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    deletes: Mutex<Vec<DeleteCall>>,
    cancel_calls: AtomicUsize,
    fail_deletes: AtomicBool,
    delete_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MockBackend {
    pub fn new(history: Vec<Message>) -> Self {
        Self {
            history: Arc::new(InMemoryHistory::with_messages(history)),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            cancel_calls: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
            delete_gate: Mutex::new(None),
        }
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<DeleteCall> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Hold every delete: signal `reached`, then block until `gate` opens.
    pub fn gate_deletes(&self, reached: &Arc<Notify>, gate: &Arc<Notify>) {
        *self.delete_gate.lock().unwrap() = Some((Arc::clone(reached), Arc::clone(gate)));
    }

    async fn pass_delete_gate(&self) {
        let gate = self.delete_gate.lock().unwrap().clone();
        if let Some((reached, gate)) = gate {
            reached.notify_one();
            gate.notified().await;
        }
    }

    fn record_delete(&self, call: DeleteCall) -> Result<()> {
        self.deletes.lock().unwrap().push(call);
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("delete rejected (status 500)");
        }
        Ok(())
    }
}

#[async_trait]
impl TurnTransport for MockBackend {
    async fn open_stream(
        &self,
        request: &StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::reply(&["ok"]));
        let Script { open_error, steps } = script;
        if let Some(message) = open_error {
            bail!(message);
        }

        let history = Arc::clone(&self.history);
        let request = request.clone();
        Ok(Box::pin(stream! {
            let mut reply = String::new();
            for step in steps {
                match step {
                    Step::Event(event) => {
                        match &event {
                            StreamEvent::Delta { text } => reply.push_str(text),
                            StreamEvent::Done { ephemeral: false } => {
                                if !request.skip_user_message_echo {
                                    history.append(Role::User, request.seed_text.clone()).ok();
                                }
                                history.append(Role::Assistant, reply.clone()).ok();
                            }
                            _ => {}
                        }
                        yield Ok(event);
                    }
                    Step::Wait(gate) => gate.notified().await,
                    Step::Reached(signal) => signal.notify_one(),
                    Step::Fail(message) => {
                        yield Err(anyhow!(message));
                        break;
                    }
                }
            }
        }))
    }

    async fn notify_cancel(&self, _chat_id: &ChatId) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MockBackend {
    async fn history(&self) -> Result<Vec<Message>> {
        self.history.history().await
    }

    async fn raw_history(&self) -> Result<Vec<Message>> {
        self.history.raw_history().await
    }

    async fn delete_from_user(&self, anchor: &UserAnchor) -> Result<()> {
        self.record_delete(DeleteCall::FromUser(anchor.clone()))?;
        self.pass_delete_gate().await;
        self.history.delete_from_user(anchor).await
    }

    async fn delete_from_assistant(&self, timestamp: &MessageTimestamp) -> Result<()> {
        self.record_delete(DeleteCall::FromAssistant(timestamp.clone()))?;
        self.pass_delete_gate().await;
        self.history.delete_from_assistant(timestamp).await
    }

    async fn delete_assistant_message(&self, timestamp: &MessageTimestamp) -> Result<()> {
        self.record_delete(DeleteCall::AssistantMessage(timestamp.clone()))?;
        self.pass_delete_gate().await;
        self.history.delete_assistant_message(timestamp).await
    }
}

// ===================
// Recording audio
// ===================

#[derive(Default)]
pub struct RecordingAudio {
    played: Mutex<Vec<String>>,
}

impl RecordingAudio {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioPlayer for RecordingAudio {
    async fn play_text(&self, text: &str) -> Result<()> {
        self.played.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

// ===================
// Harness
// ===================

pub type TestController = TurnController<MockBackend, MockBackend, BufferRenderer, RecordingAudio>;

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub renderer: Arc<BufferRenderer>,
    pub audio: Arc<RecordingAudio>,
    pub reconciler: Arc<HistoryReconciler<MockBackend, BufferRenderer>>,
    pub controller: Arc<TestController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_history(Vec::new())
    }

    pub fn with_history(history: Vec<Message>) -> Self {
        Self::with_config(history, test_config())
    }

    pub fn with_config(history: Vec<Message>, config: ClientConfig) -> Self {
        let backend = Arc::new(MockBackend::new(history));
        let renderer = Arc::new(BufferRenderer::new());
        let audio = Arc::new(RecordingAudio::default());
        let reconciler = Arc::new(HistoryReconciler::new(
            Arc::clone(&backend),
            Arc::clone(&renderer),
            config.reconcile_debounce,
        ));
        let controller = Arc::new(TurnController::new(
            Arc::clone(&backend),
            Arc::clone(&reconciler),
            Arc::clone(&renderer),
            Arc::clone(&audio),
            config,
        ));
        Self {
            backend,
            renderer,
            audio,
            reconciler,
            controller,
        }
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::fast(ChatId::from_string("chat-1"))
}

/// Yield to the runtime until `condition` holds or the attempts run out.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}

pub fn ts(s: &str) -> MessageTimestamp {
    MessageTimestamp::new(s)
}
