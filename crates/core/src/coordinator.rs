//! Single-owner runtime around [`SessionState`].
//!
//! The coordinator is an actor: one task owns the session and consumes an
//! inbox of [`Input`] messages, so every phase transition is one atomic
//! message handler. Slow work (speech capture, LLM classification, database
//! writes) runs in spawned tasks that post their result back to the inbox
//! together with the ticket they were started with.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{mpsc, watch};

use crate::{
    Command,
    embedding::Embedding,
    identity::{ConversationLogEntry, Identity, IdentityId, IdentityStore},
    intent::{Intent, IntentClassifier, IntentContext},
    session_state::{Effect, Phase, SessionSettings, SessionState, Ticket},
    speech::{DEFAULT_LISTEN_TIMEOUT, SpeechError, SpeechRecognizer},
};

/// Messages consumed by the coordinator.
pub enum Input {
    /// Face encodings extracted from one camera frame.
    Frame(Vec<Embedding>),
    Heard {
        ticket: Ticket,
        heard: Result<String, SpeechError>,
    },
    Classified {
        ticket: Ticket,
        transcript: String,
        result: anyhow::Result<Intent>,
    },
    Registered {
        ticket: Ticket,
        result: anyhow::Result<Identity>,
    },
}

#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn IdentityStore>,
    pub speech: Arc<dyn SpeechRecognizer>,
    pub intent: Arc<dyn IntentClassifier>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub session: SessionSettings,
    /// How long a capture waits for speech to start.
    pub listen_timeout: Duration,
    /// Extra time a listen may take after `listen_timeout` to record and
    /// transcribe before it is abandoned as a timeout.
    pub speech_allowance: Duration,
    /// Ceiling on one classification, history lookup included.
    pub classify_timeout: Duration,
    pub history_limit: usize,
    pub inbox_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            speech_allowance: Duration::from_secs(45),
            classify_timeout: Duration::from_secs(60),
            history_limit: 20,
            inbox_capacity: 64,
        }
    }
}

/// Cloneable entry point used by the transport.
#[derive(Clone)]
pub struct CoordinatorHandle {
    input_tx: mpsc::Sender<Input>,
    phase_rx: watch::Receiver<Phase>,
}

impl CoordinatorHandle {
    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != Phase::Idle
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    /// Offers a frame to the session. Frames are superseded by newer ones, so
    /// a frame that arrives while the session is busy or the inbox is full is
    /// dropped rather than queued. Returns whether the frame was accepted.
    pub fn submit_frame(&self, embeddings: Vec<Embedding>) -> bool {
        if self.is_busy() {
            return false;
        }
        match self.input_tx.try_send(Input::Frame(embeddings)) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!("Frame not accepted: {}", e);
                false
            }
        }
    }
}

pub struct SessionCoordinator {
    state: SessionState,
    deps: Collaborators,
    listen_timeout: Duration,
    speech_allowance: Duration,
    classify_timeout: Duration,
    history_limit: usize,
    input_rx: mpsc::Receiver<Input>,
    // Weak so the inbox closes once every handle and in-flight task is gone.
    results_tx: mpsc::WeakSender<Input>,
    command_tx: mpsc::Sender<Command>,
    phase_tx: watch::Sender<Phase>,
}

impl SessionCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        deps: Collaborators,
        command_tx: mpsc::Sender<Command>,
    ) -> (Self, CoordinatorHandle) {
        let (input_tx, input_rx) = mpsc::channel(settings.inbox_capacity);
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let coordinator = Self {
            state: SessionState::new(settings.session),
            deps,
            listen_timeout: settings.listen_timeout,
            speech_allowance: settings.speech_allowance,
            classify_timeout: settings.classify_timeout,
            history_limit: settings.history_limit,
            input_rx,
            results_tx: input_tx.downgrade(),
            command_tx,
            phase_tx,
        };
        let handle = CoordinatorHandle { input_tx, phase_rx };
        (coordinator, handle)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn run(mut self) {
        tracing::info!("Session coordinator started");
        while let Some(input) = self.input_rx.recv().await {
            self.handle(input).await;
        }
        tracing::info!("Session coordinator stopped");
    }

    pub async fn handle(&mut self, input: Input) {
        let effects = match input {
            Input::Frame(embeddings) => {
                self.state
                    .handle_frame(&embeddings, Instant::now(), self.deps.store.as_ref())
            }
            Input::Heard { ticket, heard } => self.state.handle_heard(ticket, heard),
            Input::Classified {
                ticket,
                transcript,
                result,
            } => self.state.handle_classified(ticket, &transcript, result),
            Input::Registered { ticket, result } => self.state.handle_registered(ticket, result),
        };
        debug_assert!(self.state.invariants_hold(), "{:?}", self.state);

        self.phase_tx.send_replace(self.state.phase());
        for effect in effects {
            self.apply(effect).await;
        }
    }

    async fn apply(&self, effect: Effect) {
        match effect {
            Effect::Emit(command) => {
                if let Err(e) = self.command_tx.send(command).await {
                    tracing::warn!("Command receiver dropped, discarding {:?}", e.0);
                }
            }
            Effect::Listen { ticket } => self.spawn_listen(ticket),
            Effect::Classify {
                ticket,
                transcript,
                speaker,
            } => self.spawn_classify(ticket, transcript, speaker),
            Effect::Register {
                ticket,
                name,
                embedding,
            } => self.spawn_register(ticket, name, embedding),
            Effect::LogExchange {
                identity_id,
                user,
                bot,
            } => self.spawn_log(identity_id, user, bot),
        }
    }

    fn spawn_listen(&self, ticket: Ticket) {
        // The phase may have moved on between the request and now.
        if !self.state.is_current(ticket) {
            tracing::debug!("Skipping voice capture for stale ticket {}", ticket);
            return;
        }
        let Some(results) = self.results_tx.upgrade() else {
            return;
        };
        let speech = self.deps.speech.clone();
        let timeout = self.listen_timeout;
        let ceiling = timeout.saturating_add(self.speech_allowance);

        tokio::spawn(async move {
            tracing::debug!("Listening (ticket {})...", ticket);
            let heard = tokio::time::timeout(ceiling, speech.listen(timeout))
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!("Voice capture did not finish within {:?}", ceiling);
                    Err(SpeechError::Timeout)
                });
            if results.send(Input::Heard { ticket, heard }).await.is_err() {
                tracing::warn!("Coordinator stopped before voice capture finished");
            }
        });
    }

    fn spawn_classify(&self, ticket: Ticket, transcript: String, speaker: Identity) {
        let Some(results) = self.results_tx.upgrade() else {
            return;
        };
        let store = self.deps.store.clone();
        let intent = self.deps.intent.clone();
        let vocabulary = self.state.settings().vocabulary.clone();
        let limit = self.history_limit;
        let ceiling = self.classify_timeout;

        tokio::spawn(async move {
            let classify = async {
                let history = load_history(store, speaker.id, limit).await;
                let context = IntentContext {
                    speaker: speaker.display_name,
                    history,
                };
                intent.classify(&transcript, &vocabulary, &context).await
            };
            let result = tokio::time::timeout(ceiling, classify)
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("Classification timed out after {ceiling:?}")));
            let message = Input::Classified {
                ticket,
                transcript,
                result,
            };
            if results.send(message).await.is_err() {
                tracing::warn!("Coordinator stopped before classification finished");
            }
        });
    }

    fn spawn_register(&self, ticket: Ticket, name: String, embedding: Embedding) {
        let Some(results) = self.results_tx.upgrade() else {
            return;
        };
        let store = self.deps.store.clone();

        tokio::spawn(async move {
            let result = blocking(move || store.register(&name, &embedding)).await;
            if results.send(Input::Registered { ticket, result }).await.is_err() {
                tracing::warn!("Coordinator stopped before registration finished");
            }
        });
    }

    fn spawn_log(&self, identity_id: IdentityId, user: String, bot: String) {
        let store = self.deps.store.clone();
        tokio::spawn(async move {
            if let Err(e) = blocking(move || store.append_exchange(identity_id, &user, &bot)).await
            {
                tracing::error!("Failed to save conversation for {}: {:?}", identity_id, e);
            }
        });
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Identity store call panicked")?
}

async fn load_history(
    store: Arc<dyn IdentityStore>,
    identity_id: IdentityId,
    limit: usize,
) -> Vec<ConversationLogEntry> {
    match blocking(move || store.history(identity_id, limit)).await {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!("Could not load history for {}: {:?}", identity_id, e);
            vec![]
        }
    }
}
