use crate::{
    Command,
    debounce::{Debounce, Observation},
    dispatch::{self, CommandVocabulary},
    embedding::{Embedding, SAME_FACE_THRESHOLD},
    identity::{Identity, IdentityId, IdentityStore},
    intent::Intent,
    speech::SpeechError,
};
use std::time::{Duration, Instant};

pub const NAME_PROMPT: &str = "I don't recognize you. Please say your name.";
pub const RETRY_PROMPT: &str = "Sorry, I didn't catch that. Please try again.";
pub const TRY_AGAIN_PROMPT: &str = "Okay, let's try again. Please say your name.";

/// Replies accepted as a "yes" when confirming a spoken name.
pub const AFFIRMATIVE_REPLIES: [&str; 4] = ["yes", "yeah", "correct", "yep"];

pub fn confirmation_prompt(name: &str) -> String {
    format!("Did you say {name}? Please say yes or no.")
}

pub fn welcome_message(name: &str) -> String {
    format!("Welcome, {name}. You're now registered!")
}

pub fn is_affirmative(reply: &str) -> bool {
    let normalized = reply.trim().to_lowercase();
    AFFIRMATIVE_REPLIES.contains(&normalized.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Registering,
    Listening,
}

/// Kind of background unit currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Listen,
    Classify,
    CaptureName,
    ConfirmName,
    Register,
}

impl Cycle {
    fn phase(self) -> Phase {
        match self {
            Cycle::Listen | Cycle::Classify => Phase::Listening,
            Cycle::CaptureName | Cycle::ConfirmName | Cycle::Register => Phase::Registering,
        }
    }
}

/// Issued with every background unit and echoed back with its result.
pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRegistration {
    pub embedding: Embedding,
    pub candidate_name: Option<String>,
    /// Name captures started so far in this registration, including the first.
    pub attempts: u32,
}

/// Side effects requested by a transition. The coordinator executes them.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(Command),
    /// Start one bounded speech capture.
    Listen { ticket: Ticket },
    Classify {
        ticket: Ticket,
        transcript: String,
        speaker: Identity,
    },
    Register {
        ticket: Ticket,
        name: String,
        embedding: Embedding,
    },
    LogExchange {
        identity_id: IdentityId,
        user: String,
        bot: String,
    },
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub registration_hold: Duration,
    pub same_face_threshold: f64,
    pub max_name_attempts: u32,
    pub vocabulary: CommandVocabulary,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            registration_hold: Duration::from_secs(3),
            same_face_threshold: SAME_FACE_THRESHOLD,
            max_name_attempts: 3,
            vocabulary: CommandVocabulary::default(),
        }
    }
}

/// The single visitor session.
///
/// Every method is a synchronous transition: it mutates the state and returns
/// the effects to run. Results of background work come back through
/// `handle_heard`, `handle_classified` and `handle_registered` carrying the
/// ticket they were issued with; a result whose ticket is no longer the active
/// one is dropped without touching the state.
#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    current_identity: Option<Identity>,
    pending_registration: Option<PendingRegistration>,
    debounce: Debounce,
    active: Option<(Ticket, Cycle)>,
    next_ticket: Ticket,
    settings: SessionSettings,
}

impl SessionState {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            phase: Phase::Idle,
            current_identity: None,
            pending_registration: None,
            debounce: Debounce::NoObservation,
            active: None,
            next_ticket: 0,
            settings,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn current_identity(&self) -> Option<&Identity> {
        self.current_identity.as_ref()
    }

    pub fn pending_registration(&self) -> Option<&PendingRegistration> {
        self.pending_registration.as_ref()
    }

    pub fn debounce(&self) -> &Debounce {
        &self.debounce
    }

    pub fn active_cycle(&self) -> Option<(Ticket, Cycle)> {
        self.active
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// True while `ticket` identifies the outstanding unit and the phase still fits it.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        matches!(self.active, Some((t, cycle)) if t == ticket && cycle.phase() == self.phase)
    }

    pub fn invariants_hold(&self) -> bool {
        let phase_ok = match self.phase {
            Phase::Idle => self.pending_registration.is_none(),
            Phase::Registering => {
                self.current_identity.is_none() && self.pending_registration.is_some()
            }
            Phase::Listening => {
                self.current_identity.is_some() && self.pending_registration.is_none()
            }
        };
        let cycle_ok = match self.active {
            Some((_, cycle)) => cycle.phase() == self.phase,
            None => self.phase == Phase::Idle,
        };
        phase_ok && cycle_ok
    }

    pub fn handle_frame(
        &mut self,
        embeddings: &[Embedding],
        now: Instant,
        store: &dyn IdentityStore,
    ) -> Vec<Effect> {
        if self.is_busy() {
            tracing::trace!("Dropping frame while {:?}", self.phase);
            return vec![];
        }

        let Some(face) = embeddings.first() else {
            self.current_identity = None;
            return vec![];
        };
        if embeddings.len() > 1 {
            tracing::debug!("{} faces in frame, using the first", embeddings.len());
        }

        match store.find_match(face) {
            Ok(Some(identity)) => self.on_recognized(identity),
            Ok(None) => self.on_unrecognized(face, now),
            Err(e) => {
                tracing::warn!("Identity lookup failed, dropping frame: {:?}", e);
                vec![]
            }
        }
    }

    fn on_recognized(&mut self, identity: Identity) -> Vec<Effect> {
        tracing::info!("Recognized {} (id {})", identity.display_name, identity.id);
        self.current_identity = Some(identity);
        self.debounce.reset();

        if self.phase != Phase::Idle {
            return vec![];
        }
        self.phase = Phase::Listening;
        let ticket = self.begin(Cycle::Listen);
        vec![Effect::Listen { ticket }]
    }

    fn on_unrecognized(&mut self, face: &Embedding, now: Instant) -> Vec<Effect> {
        let observation = self.debounce.observe(
            face,
            now,
            self.settings.registration_hold,
            self.settings.same_face_threshold,
        );

        match observation {
            Observation::Started => {
                tracing::debug!("New unrecognized face, starting registration hold");
                vec![]
            }
            Observation::Holding(_) => vec![],
            Observation::Held(elapsed) if self.phase != Phase::Registering => {
                tracing::info!(
                    "Unrecognized face held for {:.1}s, starting registration",
                    elapsed.as_secs_f32()
                );
                self.phase = Phase::Registering;
                self.current_identity = None;
                self.pending_registration = Some(PendingRegistration {
                    embedding: face.clone(),
                    candidate_name: None,
                    attempts: 1,
                });
                let ticket = self.begin(Cycle::CaptureName);
                vec![
                    Effect::Emit(Command::SpeakText(NAME_PROMPT.to_string())),
                    Effect::Listen { ticket },
                ]
            }
            Observation::Held(_) => vec![],
        }
    }

    /// Applies the outcome of a speech capture to whichever cycle asked for it.
    pub fn handle_heard(
        &mut self,
        ticket: Ticket,
        heard: Result<String, SpeechError>,
    ) -> Vec<Effect> {
        let listening = [Cycle::Listen, Cycle::CaptureName, Cycle::ConfirmName];
        match self.claim(ticket, &listening) {
            Some(Cycle::Listen) => self.on_utterance(heard),
            Some(Cycle::CaptureName) => self.on_name(heard),
            Some(Cycle::ConfirmName) => self.on_confirmation(heard),
            _ => vec![],
        }
    }

    fn on_utterance(&mut self, heard: Result<String, SpeechError>) -> Vec<Effect> {
        let transcript = match heard {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!("Voice capture failed: {}", e);
                self.finish_listening();
                return vec![];
            }
        };
        if transcript.is_empty() {
            tracing::info!("Empty transcription, nothing to dispatch");
            self.finish_listening();
            return vec![];
        }

        let Some(speaker) = self.current_identity.clone() else {
            self.finish_listening();
            return vec![];
        };
        tracing::info!("{} said: {:?}", speaker.display_name, transcript);
        let ticket = self.begin(Cycle::Classify);
        vec![Effect::Classify {
            ticket,
            transcript,
            speaker,
        }]
    }

    pub fn handle_classified(
        &mut self,
        ticket: Ticket,
        transcript: &str,
        result: anyhow::Result<Intent>,
    ) -> Vec<Effect> {
        if self.claim(ticket, &[Cycle::Classify]).is_none() {
            return vec![];
        }
        self.finish_listening();

        let intent = match result {
            Ok(intent) => intent,
            Err(e) => {
                tracing::error!("LLM processing failed: {:?}", e);
                return vec![];
            }
        };

        let outcome = dispatch::dispatch(intent, &self.settings.vocabulary);
        let mut effects = vec![Effect::Emit(outcome.command)];
        if let Some(identity) = &self.current_identity {
            effects.push(Effect::LogExchange {
                identity_id: identity.id,
                user: format!("User: {transcript}"),
                bot: format!("Bot: {}", outcome.reply),
            });
        }
        effects
    }

    fn on_name(&mut self, heard: Result<String, SpeechError>) -> Vec<Effect> {
        let name = match heard {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!("Error capturing name: {}", e);
                String::new()
            }
        };

        // A failed name capture does not re-prompt on its own; the visitor
        // starts over by holding still in front of the camera again.
        if name.is_empty() {
            self.end_registration();
            return vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))];
        }

        let Some(pending) = self.pending_registration.as_mut() else {
            self.end_registration();
            return vec![];
        };
        pending.candidate_name = Some(name.clone());
        let ticket = self.begin(Cycle::ConfirmName);
        vec![
            Effect::Emit(Command::SpeakText(confirmation_prompt(&name))),
            Effect::Listen { ticket },
        ]
    }

    fn on_confirmation(&mut self, heard: Result<String, SpeechError>) -> Vec<Effect> {
        let reply = match heard {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Error confirming name: {}", e);
                self.end_registration();
                return vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))];
            }
        };
        let Some(pending) = self.pending_registration.as_mut() else {
            self.end_registration();
            return vec![];
        };

        if is_affirmative(&reply) {
            let Some(name) = pending.candidate_name.clone() else {
                self.end_registration();
                return vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))];
            };
            let embedding = pending.embedding.clone();
            let ticket = self.begin(Cycle::Register);
            return vec![Effect::Register {
                ticket,
                name,
                embedding,
            }];
        }

        if pending.attempts >= self.settings.max_name_attempts {
            tracing::info!("Giving up on registration after {} attempts", pending.attempts);
            self.end_registration();
            return vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))];
        }

        tracing::debug!("Name not confirmed ({:?}), asking again", reply);
        pending.attempts += 1;
        pending.candidate_name = None;
        let ticket = self.begin(Cycle::CaptureName);
        vec![
            Effect::Emit(Command::SpeakText(TRY_AGAIN_PROMPT.to_string())),
            Effect::Listen { ticket },
        ]
    }

    pub fn handle_registered(
        &mut self,
        ticket: Ticket,
        result: anyhow::Result<Identity>,
    ) -> Vec<Effect> {
        if self.claim(ticket, &[Cycle::Register]).is_none() {
            return vec![];
        }
        self.end_registration();

        match result {
            Ok(identity) => {
                tracing::info!(
                    "Registered {} as identity {}",
                    identity.display_name,
                    identity.id
                );
                vec![Effect::Emit(Command::SpeakText(welcome_message(
                    &identity.display_name,
                )))]
            }
            Err(e) => {
                tracing::error!("Failed to persist new identity: {:?}", e);
                vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))]
            }
        }
    }

    fn begin(&mut self, cycle: Cycle) -> Ticket {
        self.next_ticket += 1;
        self.active = Some((self.next_ticket, cycle));
        self.next_ticket
    }

    /// Takes the active cycle if `ticket` still names it and it is one of `accepted`.
    fn claim(&mut self, ticket: Ticket, accepted: &[Cycle]) -> Option<Cycle> {
        match self.active {
            Some((_, cycle)) if self.is_current(ticket) && accepted.contains(&cycle) => {
                self.active = None;
                Some(cycle)
            }
            _ => {
                tracing::debug!(
                    "Discarding stale result for ticket {} (active {:?}, phase {:?})",
                    ticket,
                    self.active,
                    self.phase
                );
                None
            }
        }
    }

    fn finish_listening(&mut self) {
        self.active = None;
        self.phase = Phase::Idle;
    }

    fn end_registration(&mut self) {
        self.active = None;
        self.phase = Phase::Idle;
        self.pending_registration = None;
        self.debounce.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityStore;

    fn ada() -> Identity {
        Identity {
            id: 7,
            display_name: "Ada".to_string(),
            embedding: Embedding::new(vec![0.9, 0.9, 0.9]),
        }
    }

    fn stranger(x: f64) -> Embedding {
        Embedding::new(vec![x, 0.0, 0.0])
    }

    fn store_returning(result: Option<Identity>) -> MockIdentityStore {
        let mut store = MockIdentityStore::new();
        store
            .expect_find_match()
            .returning(move |_| Ok(result.clone()));
        store
    }

    fn listen_ticket(effects: &[Effect]) -> Ticket {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Listen { ticket } => Some(*ticket),
                _ => None,
            })
            .expect("a Listen effect")
    }

    fn spoken(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(Command::SpeakText(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drives a fresh session into Registering with stranger(0.0).
    fn registering_session(t0: Instant) -> (SessionState, Ticket) {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(None);
        session.handle_frame(&[stranger(0.0)], t0, &store);
        let effects =
            session.handle_frame(&[stranger(0.05)], t0 + Duration::from_millis(3500), &store);
        assert_eq!(session.phase(), Phase::Registering);
        (session, listen_ticket(&effects))
    }

    #[test]
    fn frames_without_faces_clear_identity_and_keep_phase() {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(Some(ada()));
        let t0 = Instant::now();

        let ticket = listen_ticket(&session.handle_frame(&[stranger(1.0)], t0, &store));
        session.handle_heard(ticket, Err(SpeechError::Timeout));
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.current_identity().is_some());

        for i in 0..5 {
            let effects = session.handle_frame(&[], t0 + Duration::from_secs(i), &store);
            assert!(effects.is_empty());
            assert_eq!(session.phase(), Phase::Idle);
            assert!(session.current_identity().is_none());
        }
    }

    #[test]
    fn frames_without_faces_leave_the_debounce_alone() {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(None);
        let t0 = Instant::now();

        session.handle_frame(&[stranger(0.0)], t0, &store);
        session.handle_frame(&[], t0 + Duration::from_secs(1), &store);
        assert_eq!(session.debounce().subject(), Some(&stranger(0.0)));
    }

    #[test]
    fn match_launches_exactly_one_listen_cycle() {
        let mut session = SessionState::new(SessionSettings::default());
        let mut store = MockIdentityStore::new();
        // Frames arriving while listening never reach the store.
        store
            .expect_find_match()
            .times(1)
            .returning(|_| Ok(Some(ada())));
        let t0 = Instant::now();

        let effects = session.handle_frame(&[stranger(1.0)], t0, &store);
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Listen { .. }));
        assert_eq!(session.phase(), Phase::Listening);
        assert_eq!(session.current_identity(), Some(&ada()));

        for i in 1..4 {
            let effects = session.handle_frame(&[stranger(1.0)], t0 + Duration::from_secs(i), &store);
            assert!(effects.is_empty());
        }
        assert!(session.invariants_hold());
    }

    #[test]
    fn only_the_first_face_is_considered() {
        let mut session = SessionState::new(SessionSettings::default());
        let mut store = MockIdentityStore::new();
        store
            .expect_find_match()
            .withf(|e| *e == Embedding::new(vec![1.0, 0.0, 0.0]))
            .times(1)
            .returning(|_| Ok(None));

        session.handle_frame(&[stranger(1.0), stranger(9.0)], Instant::now(), &store);
        assert_eq!(session.debounce().subject(), Some(&stranger(1.0)));
    }

    #[test]
    fn unmatched_face_held_past_the_hold_starts_registration_once() {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(None);
        let t0 = Instant::now();

        for ms in [0, 1000, 2000, 2900] {
            let effects =
                session.handle_frame(&[stranger(0.01)], t0 + Duration::from_millis(ms), &store);
            assert!(effects.is_empty(), "no trigger at {ms}ms");
        }

        let effects = session.handle_frame(&[stranger(0.02)], t0 + Duration::from_millis(3500), &store);
        assert_eq!(spoken(&effects), vec![NAME_PROMPT.to_string()]);
        assert_eq!(effects.len(), 2);
        assert_eq!(session.phase(), Phase::Registering);
        assert_eq!(
            session.pending_registration().map(|p| &p.embedding),
            Some(&stranger(0.02))
        );

        // Later frames are dropped; the prompt is not repeated.
        for ms in [3600, 5000, 9000] {
            let effects =
                session.handle_frame(&[stranger(0.01)], t0 + Duration::from_millis(ms), &store);
            assert!(effects.is_empty());
        }
        assert!(session.invariants_hold());
    }

    #[test]
    fn switching_faces_before_the_hold_resets_the_timer() {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(None);
        let t0 = Instant::now();

        session.handle_frame(&[stranger(0.0)], t0, &store);
        session.handle_frame(&[stranger(5.0)], t0 + Duration::from_secs(2), &store);
        let effects = session.handle_frame(&[stranger(5.0)], t0 + Duration::from_millis(3500), &store);

        assert!(effects.is_empty());
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn a_match_inside_the_window_prevents_registration() {
        let mut session = SessionState::new(SessionSettings::default());
        let t0 = Instant::now();

        session.handle_frame(&[stranger(0.0)], t0, &store_returning(None));
        let ticket = listen_ticket(&session.handle_frame(
            &[stranger(0.0)],
            t0 + Duration::from_secs(1),
            &store_returning(Some(ada())),
        ));
        session.handle_heard(ticket, Err(SpeechError::NoSpeech));

        let effects = session.handle_frame(
            &[stranger(0.0)],
            t0 + Duration::from_millis(3500),
            &store_returning(None),
        );
        assert!(effects.is_empty());
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn confirmed_name_is_registered_and_session_resets() {
        let t0 = Instant::now();
        let (mut session, ticket) = registering_session(t0);

        let effects = session.handle_heard(ticket, Ok("  Ada Lovelace ".to_string()));
        assert_eq!(spoken(&effects), vec![confirmation_prompt("Ada Lovelace")]);
        let ticket = listen_ticket(&effects);

        let effects = session.handle_heard(ticket, Ok(" YES ".to_string()));
        let (ticket, name, embedding) = match &effects[..] {
            [Effect::Register {
                ticket,
                name,
                embedding,
            }] => (*ticket, name.clone(), embedding.clone()),
            other => panic!("expected a Register effect, got {other:?}"),
        };
        assert_eq!(name, "Ada Lovelace");
        assert_eq!(embedding, stranger(0.05));
        assert_eq!(session.phase(), Phase::Registering);

        let identity = Identity {
            id: 1,
            display_name: name,
            embedding,
        };
        let effects = session.handle_registered(ticket, Ok(identity));
        assert_eq!(spoken(&effects), vec![welcome_message("Ada Lovelace")]);
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.pending_registration().is_none());
        assert_eq!(session.debounce(), &Debounce::NoObservation);
        assert!(session.invariants_hold());
    }

    #[test]
    fn every_affirmative_reply_is_accepted() {
        for reply in ["yes", "Yeah", " CORRECT", "yep\n"] {
            assert!(is_affirmative(reply), "{reply:?}");
        }
        for reply in ["no", "yes please", "nope", ""] {
            assert!(!is_affirmative(reply), "{reply:?}");
        }
    }

    #[test]
    fn a_negative_confirmation_asks_for_the_name_again() {
        let (mut session, ticket) = registering_session(Instant::now());
        let ticket = listen_ticket(&session.handle_heard(ticket, Ok("Bob".to_string())));

        let effects = session.handle_heard(ticket, Ok("no".to_string()));
        assert_eq!(spoken(&effects), vec![TRY_AGAIN_PROMPT.to_string()]);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Register { .. })));
        assert_eq!(session.phase(), Phase::Registering);
        assert_eq!(session.active_cycle().map(|(_, c)| c), Some(Cycle::CaptureName));

        let pending = session.pending_registration().expect("still registering");
        assert_eq!(pending.candidate_name, None);
        assert_eq!(pending.attempts, 2);
    }

    #[test]
    fn registration_gives_up_after_the_attempt_limit() {
        let (mut session, mut ticket) = registering_session(Instant::now());

        for _ in 1..session.settings().max_name_attempts {
            ticket = listen_ticket(&session.handle_heard(ticket, Ok("Bob".to_string())));
            ticket = listen_ticket(&session.handle_heard(ticket, Ok("nope".to_string())));
        }
        ticket = listen_ticket(&session.handle_heard(ticket, Ok("Bob".to_string())));
        let effects = session.handle_heard(ticket, Ok("nope".to_string()));

        assert_eq!(spoken(&effects), vec![RETRY_PROMPT.to_string()]);
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.pending_registration().is_none());
    }

    #[test]
    fn name_capture_timeout_prompts_retry_and_returns_to_idle() {
        let (mut session, ticket) = registering_session(Instant::now());

        let effects = session.handle_heard(ticket, Err(SpeechError::Timeout));
        assert_eq!(effects, vec![Effect::Emit(Command::SpeakText(RETRY_PROMPT.to_string()))]);
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.pending_registration().is_none());
        assert_eq!(session.debounce(), &Debounce::NoObservation);
    }

    #[test]
    fn confirmation_failure_prompts_retry_and_returns_to_idle() {
        let (mut session, ticket) = registering_session(Instant::now());
        let ticket = listen_ticket(&session.handle_heard(ticket, Ok("Cy".to_string())));

        let effects = session.handle_heard(ticket, Err(SpeechError::Service("503".to_string())));
        assert_eq!(spoken(&effects), vec![RETRY_PROMPT.to_string()]);
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.invariants_hold());
    }

    #[test]
    fn failed_store_write_prompts_retry_and_returns_to_idle() {
        let (mut session, ticket) = registering_session(Instant::now());
        let ticket = listen_ticket(&session.handle_heard(ticket, Ok("Cy".to_string())));
        let ticket = match &session.handle_heard(ticket, Ok("yep".to_string()))[..] {
            [Effect::Register { ticket, .. }] => *ticket,
            other => panic!("expected a Register effect, got {other:?}"),
        };

        let effects = session.handle_registered(ticket, Err(anyhow::anyhow!("disk full")));
        assert_eq!(spoken(&effects), vec![RETRY_PROMPT.to_string()]);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn stale_results_are_ignored() {
        let (mut session, ticket) = registering_session(Instant::now());

        assert!(session.handle_heard(ticket + 10, Ok("Eve".to_string())).is_empty());
        assert!(session.handle_classified(ticket, "hi", Ok(Intent::Conversation("x".into()))).is_empty());
        assert!(session.handle_registered(ticket, Ok(ada())).is_empty());

        // The real cycle is still outstanding and unaffected.
        assert!(session.is_current(ticket));
        assert_eq!(session.phase(), Phase::Registering);
        let effects = session.handle_heard(ticket, Ok("Eve".to_string()));
        assert_eq!(spoken(&effects), vec![confirmation_prompt("Eve")]);
    }

    #[test]
    fn command_utterance_executes_and_logs_the_exchange() {
        let mut session = SessionState::new(SessionSettings::default());
        let ticket = listen_ticket(&session.handle_frame(
            &[stranger(1.0)],
            Instant::now(),
            &store_returning(Some(ada())),
        ));

        let effects = session.handle_heard(ticket, Ok(" move forward ".to_string()));
        let ticket = match &effects[..] {
            [Effect::Classify {
                ticket,
                transcript,
                speaker,
            }] => {
                assert_eq!(transcript, "move forward");
                assert_eq!(speaker, &ada());
                *ticket
            }
            other => panic!("expected a Classify effect, got {other:?}"),
        };
        assert_eq!(session.phase(), Phase::Listening);

        let effects = session.handle_classified(
            ticket,
            "move forward",
            Ok(Intent::Command("move forward".to_string())),
        );
        assert_eq!(
            effects,
            vec![
                Effect::Emit(Command::ExecuteCommand("move forward".to_string())),
                Effect::LogExchange {
                    identity_id: 7,
                    user: "User: move forward".to_string(),
                    bot: "Bot: COMMAND: move forward".to_string(),
                },
            ]
        );
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn unsupported_command_is_refused_and_not_logged_as_executed() {
        let mut session = SessionState::new(SessionSettings::default());
        let ticket = listen_ticket(&session.handle_frame(
            &[stranger(1.0)],
            Instant::now(),
            &store_returning(Some(ada())),
        ));
        let ticket = match &session.handle_heard(ticket, Ok("dance".to_string()))[..] {
            [Effect::Classify { ticket, .. }] => *ticket,
            other => panic!("expected a Classify effect, got {other:?}"),
        };

        let effects =
            session.handle_classified(ticket, "dance", Ok(Intent::Command("dance".to_string())));
        assert_eq!(
            effects[0],
            Effect::Emit(Command::SpeakText(dispatch::UNRECOGNIZED_COMMAND_REPLY.to_string()))
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::Emit(Command::ExecuteCommand(_)))));
        for effect in &effects {
            if let Effect::LogExchange { bot, .. } = effect {
                assert!(!bot.contains("COMMAND: dance"));
            }
        }
    }

    #[test]
    fn classification_failure_drops_the_exchange() {
        let mut session = SessionState::new(SessionSettings::default());
        let ticket = listen_ticket(&session.handle_frame(
            &[stranger(1.0)],
            Instant::now(),
            &store_returning(Some(ada())),
        ));
        let ticket = match &session.handle_heard(ticket, Ok("hello".to_string()))[..] {
            [Effect::Classify { ticket, .. }] => *ticket,
            other => panic!("expected a Classify effect, got {other:?}"),
        };

        let effects = session.handle_classified(ticket, "hello", Err(anyhow::anyhow!("timeout")));
        assert!(effects.is_empty());
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn failed_or_empty_listens_end_the_cycle_silently() {
        let mut session = SessionState::new(SessionSettings::default());
        let store = store_returning(Some(ada()));
        let t0 = Instant::now();

        for heard in [
            Err(SpeechError::Timeout),
            Err(SpeechError::NoSpeech),
            Ok("   ".to_string()),
        ] {
            let ticket = listen_ticket(&session.handle_frame(&[stranger(1.0)], t0, &store));
            assert!(session.handle_heard(ticket, heard).is_empty());
            assert_eq!(session.phase(), Phase::Idle);
            assert!(session.invariants_hold());
        }
    }

    #[test]
    fn lookup_errors_drop_the_frame() {
        let mut session = SessionState::new(SessionSettings::default());
        let mut store = MockIdentityStore::new();
        store
            .expect_find_match()
            .returning(|_| Err(anyhow::anyhow!("database is locked")));

        let effects = session.handle_frame(&[stranger(1.0)], Instant::now(), &store);
        assert!(effects.is_empty());
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.debounce(), &Debounce::NoObservation);
    }
}
