//! `LiveSessionController`: one bidirectional voice conversation.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ─► start() ─► Connecting ─► Active ─► Closing ─► Idle
//!                        │            │
//!                        └──► Error ◄─┘ ─► Idle
//! ```
//!
//! `start()` reads the observer's context once, connects through the
//! [`Connector`], opens the microphone and spawns the session task. The task
//! owns the [`SessionState`] and consumes inbound messages strictly one at a
//! time, so transcript accumulation and turn completion never interleave.
//!
//! ## Teardown
//!
//! Local close, remote close and transport errors all run the same teardown
//! exactly once: capture released, live lane stopped, close frame queued.
//! Only then does the observer hear `on_error` (if any) and `on_close`.

pub mod protocol;
pub mod state;
pub mod transport;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    capture::{BlockSink, CapturePipeline, CpalMicrophone, MicrophoneSource},
    codec::{decode_pcm_payload, MediaBlob},
    config::LiveConfig,
    error::{Result, VoiceError},
    events::{SessionPhase, SessionStatusEvent},
    playback::AudioOutputService,
};
use protocol::{ClientFrame, LiveMessage, SetupMessage};
use state::{Effect, SessionState};
use transport::{Connector, LiveConnection, ABNORMAL_CLOSURE};

/// Status broadcast capacity.
const STATUS_CAP: usize = 64;

/// Callbacks for one conversation. Invoked from the session task, never
/// concurrently with each other.
pub trait SessionObserver: Send + Sync + 'static {
    /// Full user transcript of the current turn so far.
    fn on_user_transcript(&self, text: &str);
    /// Full model transcript of the current turn so far.
    fn on_ai_transcript(&self, text: &str);
    /// Both transcripts of the finished turn. The buffers are already empty.
    fn on_turn_complete(&self, user: &str, ai: &str);
    fn on_error(&self, error: &VoiceError);
    /// Fired exactly once per started session.
    fn on_close(&self);
    /// Document context used to seed the system instruction. Read once.
    fn context(&self) -> String;
}

#[derive(Default)]
pub struct SessionDiagnostics {
    pub messages_in: AtomicUsize,
    pub audio_chunks: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub blocks_sent: AtomicUsize,
    pub blocks_dropped: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.messages_in.store(0, Ordering::Relaxed);
        self.audio_chunks.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.blocks_sent.store(0, Ordering::Relaxed);
        self.blocks_dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            audio_chunks: self.audio_chunks.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub messages_in: usize,
    pub audio_chunks: usize,
    pub decode_errors: usize,
    pub blocks_sent: usize,
    pub blocks_dropped: usize,
}

struct StatusCell {
    phase: Mutex<SessionPhase>,
    tx: broadcast::Sender<SessionStatusEvent>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAP);
        Self {
            phase: Mutex::new(SessionPhase::Idle),
            tx,
        }
    }

    fn get(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn set(&self, phase: SessionPhase, detail: Option<String>) {
        *self.phase.lock() = phase;
        let _ = self.tx.send(SessionStatusEvent {
            status: phase,
            detail,
        });
    }

    /// `Idle → Connecting`; `false` if a session is already underway.
    fn begin(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase != SessionPhase::Idle {
                return false;
            }
            *phase = SessionPhase::Connecting;
        }
        let _ = self.tx.send(SessionStatusEvent {
            status: SessionPhase::Connecting,
            detail: None,
        });
        true
    }
}

/// Returns the phase to `Idle` if a `start()` future is dropped mid-flight.
struct PendingStart<'a> {
    status: &'a StatusCell,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("live session start cancelled");
            self.status.set(SessionPhase::Idle, Some("start cancelled".into()));
        }
    }
}

/// Resources released when the session ends, whoever ends it.
struct Teardown {
    done: AtomicBool,
    capture: CapturePipeline,
    output: AudioOutputService,
    outbound: mpsc::Sender<ClientFrame>,
}

impl Teardown {
    /// Release everything. Only the first call does any work.
    fn run(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.capture.close();
        self.output.stop_all_live();
        if self.outbound.try_send(ClientFrame::Close).is_err() {
            debug!("close frame not queued; writer ends when the last sender drops");
        }
        true
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

pub struct LiveSessionController<C: Connector> {
    config: LiveConfig,
    connector: C,
    output: AudioOutputService,
    microphone: Arc<dyn MicrophoneSource>,
    status: Arc<StatusCell>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl<C: Connector> LiveSessionController<C> {
    /// Controller using the system microphone.
    pub fn new(config: LiveConfig, connector: C, output: AudioOutputService) -> Self {
        Self {
            config,
            connector,
            output,
            microphone: Arc::new(CpalMicrophone),
            status: Arc::new(StatusCell::new()),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    pub fn with_microphone(mut self, microphone: Arc<dyn MicrophoneSource>) -> Self {
        self.microphone = microphone;
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.status.get()
    }

    /// Subscribe to phase changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status.tx.subscribe()
    }

    pub fn diagnostics(&self) -> SessionSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn output(&self) -> &AudioOutputService {
        &self.output
    }

    /// Start a conversation.
    ///
    /// On failure everything acquired so far is released, the error is
    /// reported through `on_error` and returned, and the phase is `Idle`.
    /// Dropping the returned future before it resolves also leaves `Idle`.
    ///
    /// # Errors
    /// - `VoiceError::Config` if a session is already running or the
    ///   configuration is invalid.
    /// - `VoiceError::Connection` if the endpoint cannot be reached.
    /// - `VoiceError::Permission` if microphone access is refused.
    pub async fn start(&self, observer: Arc<dyn SessionObserver>) -> Result<SessionHandle> {
        if !self.status.begin() {
            return Err(VoiceError::Config("a live session is already running".into()));
        }
        let mut pending = PendingStart {
            status: &self.status,
            armed: true,
        };
        self.diagnostics.reset();

        let opened = self.open(&observer).await;
        pending.armed = false;
        match opened {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(error = %e, "live session failed to start");
                self.status.set(SessionPhase::Error, Some(e.to_string()));
                observer.on_error(&e);
                self.status.set(SessionPhase::Idle, None);
                Err(e)
            }
        }
    }

    async fn open(&self, observer: &Arc<dyn SessionObserver>) -> Result<SessionHandle> {
        self.config.validate()?;
        let setup = SetupMessage::new(&self.config, &observer.context());
        info!(model = self.config.model.as_str(), voice = self.config.voice.as_str(), "connecting live session");

        let LiveConnection { outbound, inbound } = self.connector.connect(setup).await?;

        let sink = outbound_sink(outbound.clone(), Arc::clone(&self.diagnostics));
        let capture_config = self.config.capture.clone();
        let microphone = Arc::clone(&self.microphone);
        let opened = tokio::task::spawn_blocking(move || {
            CapturePipeline::open(capture_config, microphone, sink)
        })
        .await
        .map_err(|e| VoiceError::Other(anyhow::anyhow!("capture open task failed: {e}")))
        .and_then(|r| r);
        let capture = match opened {
            Ok(capture) => capture,
            Err(e) => {
                let _ = outbound.try_send(ClientFrame::Close);
                return Err(e);
            }
        };

        let teardown = Arc::new(Teardown {
            done: AtomicBool::new(false),
            capture,
            output: self.output.clone(),
            outbound: outbound.clone(),
        });
        let (stop_tx, stop_rx) = oneshot::channel();

        self.status.set(SessionPhase::Active, None);
        info!("live session active");

        let task = tokio::spawn(run_session(SessionTask {
            inbound,
            stop: stop_rx,
            observer: Arc::clone(observer),
            teardown: Arc::clone(&teardown),
            output: self.output.clone(),
            output_rate: self.config.output_sample_rate,
            status: Arc::clone(&self.status),
            diagnostics: Arc::clone(&self.diagnostics),
        }));

        Ok(SessionHandle {
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            teardown,
            outbound,
        })
    }
}

/// One open conversation. Dropping the handle closes it.
pub struct SessionHandle {
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    teardown: Arc<Teardown>,
    outbound: mpsc::Sender<ClientFrame>,
}

impl SessionHandle {
    /// Release the microphone, stop model audio, close the connection and
    /// stop the session task. Idempotent.
    pub fn close(&self) {
        let Some(stop) = self.stop.lock().take() else {
            return;
        };
        if self.teardown.run() {
            info!("live session closed locally");
        }
        let _ = stop.send(());
    }

    /// Wait for the session task to finish (after `close` or a remote end).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("session task failed: {e}");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_done()
    }

    /// Microphone tracks still open for this session.
    pub fn active_tracks(&self) -> usize {
        self.teardown.capture.active_tracks()
    }

    /// Send updated document context as a non-final user turn.
    ///
    /// # Errors
    /// `VoiceError::SessionClosed` after close; `VoiceError::Connection`
    /// when the outbound queue is full.
    pub fn send_context_update(&self, context: impl Into<String>) -> Result<()> {
        if self.teardown.is_done() {
            return Err(VoiceError::SessionClosed);
        }
        self.outbound
            .try_send(ClientFrame::ContextUpdate(context.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => VoiceError::Connection("outbound queue full".into()),
                TrySendError::Closed(_) => VoiceError::SessionClosed,
            })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn outbound_sink(
    outbound: mpsc::Sender<ClientFrame>,
    diagnostics: Arc<SessionDiagnostics>,
) -> Arc<dyn BlockSink> {
    Arc::new(move |block: MediaBlob| {
        match outbound.try_send(ClientFrame::Audio(block)) {
            Ok(()) => {
                diagnostics.blocks_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                diagnostics.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("outbound queue full: dropped microphone block");
            }
            Err(TrySendError::Closed(_)) => {
                diagnostics.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("connection closed: dropped microphone block");
            }
        }
    })
}

enum Outcome {
    Local,
    Remote { code: u16, reason: String },
    Failed(VoiceError),
}

struct SessionTask {
    inbound: mpsc::Receiver<LiveMessage>,
    stop: oneshot::Receiver<()>,
    observer: Arc<dyn SessionObserver>,
    teardown: Arc<Teardown>,
    output: AudioOutputService,
    output_rate: u32,
    status: Arc<StatusCell>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl SessionTask {
    /// Decode and schedule one model audio chunk. Undecodable chunks are
    /// logged and skipped; only device failures are returned.
    fn play(&self, data: &str) -> Result<()> {
        let chunk = match decode_pcm_payload(data, self.output_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping undecodable audio chunk");
                return Ok(());
            }
        };
        self.diagnostics.audio_chunks.fetch_add(1, Ordering::Relaxed);
        match self.output.enqueue_live_chunk(chunk) {
            Ok(scheduled) => {
                debug!(
                    start = scheduled.start_secs,
                    duration = scheduled.duration_secs,
                    "model audio scheduled"
                );
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                self.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping unplayable audio chunk");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn run_session(mut task: SessionTask) {
    let mut state = SessionState::new();

    let outcome = loop {
        let message = tokio::select! {
            biased;
            _ = &mut task.stop => break Outcome::Local,
            message = task.inbound.recv() => message,
        };
        let Some(message) = message else {
            break Outcome::Remote {
                code: ABNORMAL_CLOSURE,
                reason: "inbound stream ended".into(),
            };
        };
        task.diagnostics.messages_in.fetch_add(1, Ordering::Relaxed);

        let Some(effect) = state.apply(message) else {
            continue;
        };
        match effect {
            Effect::UserTranscript(text) => task.observer.on_user_transcript(&text),
            Effect::ModelTranscript(text) => task.observer.on_ai_transcript(&text),
            Effect::PlayAudio(data) => {
                if let Err(e) = task.play(&data) {
                    break Outcome::Failed(e);
                }
            }
            Effect::FlushPlayback => {
                task.output.stop_all_live();
                debug!("model interrupted: live lane flushed");
            }
            Effect::TurnComplete { user, model } => {
                debug!(user_len = user.len(), model_len = model.len(), "turn complete");
                task.observer.on_turn_complete(&user, &model);
            }
            Effect::Fail(message) => break Outcome::Failed(VoiceError::Connection(message)),
            Effect::Closed { code, reason } => break Outcome::Remote { code, reason },
        }
    };

    match &outcome {
        Outcome::Local => task.status.set(SessionPhase::Closing, None),
        Outcome::Remote { code, reason } => {
            info!(code, reason = reason.as_str(), "live session closed by remote");
            task.status.set(SessionPhase::Closing, Some(reason.clone()));
        }
        Outcome::Failed(e) => {
            warn!(error = %e, "live session failed");
            task.status.set(SessionPhase::Error, Some(e.to_string()));
        }
    }

    let teardown = Arc::clone(&task.teardown);
    if let Err(e) = tokio::task::spawn_blocking(move || teardown.run()).await {
        warn!("session teardown failed: {e}");
    }

    if let Outcome::Failed(e) = &outcome {
        task.observer.on_error(e);
    }
    task.observer.on_close();
    task.status.set(SessionPhase::Idle, None);
    info!("live session ended");
}
