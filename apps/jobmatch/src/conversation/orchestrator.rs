//! ConversationOrchestrator — drives one profile-elicitation dialogue with the
//! reasoning gateway.
//!
//! State machine:
//!
//! ```text
//! NotStarted --start--> InProgress --submit_turn--> InProgress
//!                            |                          |
//!                            +---- gateway says done ---+--> Complete
//! ```
//!
//! `Complete` is terminal until `reset()`. The dialogue lives behind a
//! `std::sync::Mutex` that is never held across the gateway call; a call in
//! flight is tracked by a `PendingCall` guard whose `Drop` undoes the
//! optimistic user turn on every failure path, including cancellation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::conversation::models::{ConversationEvent, Profile, Speaker, Stage, Turn};
use crate::errors::{AppError, InputError, StateError};
use crate::gateway::{with_timeout, ElicitReply, ReasoningGateway};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Start,
    Turn,
}

#[derive(Default)]
struct DialogueState {
    profile: Option<Profile>,
    /// Bumped by `reset()`. A call that started under an older epoch is stale.
    epoch: u64,
    in_flight: Option<InFlight>,
    completion_announced: bool,
}

fn lock_state(state: &Mutex<DialogueState>) -> MutexGuard<'_, DialogueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a gateway call as outstanding. Unless disarmed after a successful
/// commit, dropping it clears the in-flight marker and removes the
/// optimistically appended user turn.
struct PendingCall<'a> {
    state: &'a Mutex<DialogueState>,
    epoch: u64,
    armed: bool,
}

impl PendingCall<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock_state(self.state);
        if state.epoch != self.epoch {
            return;
        }
        if state.in_flight == Some(InFlight::Turn) {
            if let Some(profile) = state.profile.as_mut() {
                if matches!(profile.history.last(), Some(t) if t.speaker == Speaker::User) {
                    profile.history.pop();
                    debug!(
                        history_len = profile.history.len(),
                        "Rolled back unanswered user turn"
                    );
                }
            }
        }
        state.in_flight = None;
    }
}

/// Owns the elicitation dialogue of one user session.
pub struct ConversationOrchestrator {
    gateway: Arc<dyn ReasoningGateway>,
    state: Mutex<DialogueState>,
    events: broadcast::Sender<ConversationEvent>,
    timeout: Duration,
}

impl ConversationOrchestrator {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            state: Mutex::new(DialogueState::default()),
            events,
            timeout,
        }
    }

    /// Begins a new dialogue and records the assistant's opening turn. A
    /// completed dialogue must be `reset()` first.
    pub async fn start(&self, locale: &str) -> Result<Profile, AppError> {
        self.start_within(locale, self.timeout).await
    }

    pub async fn start_within(&self, locale: &str, timeout: Duration) -> Result<Profile, AppError> {
        let mut call = {
            let mut state = lock_state(&self.state);
            if state.in_flight.is_some() {
                return Err(StateError::AlreadyActive.into());
            }
            match &state.profile {
                Some(p) if p.is_complete() => return Err(StateError::AlreadyComplete.into()),
                Some(_) => return Err(StateError::AlreadyActive.into()),
                None => {}
            }
            state.in_flight = Some(InFlight::Start);
            PendingCall {
                state: &self.state,
                epoch: state.epoch,
                armed: true,
            }
        };

        info!(locale, "Starting elicitation dialogue");
        let reply = with_timeout(timeout, self.gateway.elicit(None, "", locale))
            .await
            .and_then(ElicitReply::validate);

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Opening turn failed: {e}");
                return Err(self.stale_or(call.epoch, e.into()));
            }
        };

        let mut state = lock_state(&self.state);
        if state.epoch != call.epoch {
            return Err(StateError::Superseded.into());
        }

        let mut profile = Profile::new(locale);
        profile.stage = Stage::InProgress;
        profile.sub_stage = reply.stage.clone();
        profile.advance_progress(reply.progress);
        profile.history.push(Turn::assistant(reply.assistant_text));

        call.disarm();
        state.in_flight = None;
        let _ = self.events.send(ConversationEvent::Started {
            progress: profile.progress,
        });
        state.profile = Some(profile);
        if reply.is_complete {
            self.mark_complete(&mut state);
        }

        let profile = state.profile.clone().ok_or(StateError::NotStarted)?;
        info!(progress = profile.progress, "Elicitation dialogue started");
        Ok(profile)
    }

    /// Sends one user message and records the assistant's answer.
    pub async fn submit_turn(&self, user_text: &str) -> Result<Profile, AppError> {
        self.submit_turn_within(user_text, self.timeout).await
    }

    pub async fn submit_turn_within(
        &self,
        user_text: &str,
        timeout: Duration,
    ) -> Result<Profile, AppError> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(InputError::EmptyInput.into());
        }

        let (mut call, snapshot) = {
            let mut state = lock_state(&self.state);
            if state.in_flight == Some(InFlight::Turn) {
                return Err(StateError::TurnInFlight.into());
            }
            let epoch = state.epoch;
            let Some(profile) = state.profile.as_mut() else {
                return Err(StateError::NotStarted.into());
            };
            if profile.is_complete() {
                return Err(StateError::AlreadyComplete.into());
            }
            let snapshot = profile.clone();
            profile.history.push(Turn::user(text));
            state.in_flight = Some(InFlight::Turn);
            let call = PendingCall {
                state: &self.state,
                epoch,
                armed: true,
            };
            (call, snapshot)
        };

        debug!(
            history_len = snapshot.history.len(),
            "Submitting user turn to gateway"
        );
        let reply = with_timeout(
            timeout,
            self.gateway
                .elicit(Some(&snapshot), text, snapshot.locale.as_str()),
        )
        .await
        .and_then(ElicitReply::validate);

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(transient = e.is_transient(), "User turn failed, rolling back: {e}");
                return Err(self.stale_or(call.epoch, e.into()));
            }
        };

        let mut state = lock_state(&self.state);
        if state.epoch != call.epoch {
            return Err(StateError::Superseded.into());
        }

        call.disarm();
        state.in_flight = None;
        let profile = state.profile.as_mut().ok_or(StateError::NotStarted)?;
        profile.history.push(Turn::assistant(reply.assistant_text));
        if reply.stage.is_some() {
            profile.sub_stage = reply.stage;
        }
        profile.advance_progress(reply.progress);
        let _ = self.events.send(ConversationEvent::Updated {
            progress: profile.progress,
            sub_stage: profile.sub_stage.clone(),
        });
        if reply.is_complete {
            self.mark_complete(&mut state);
        }

        let profile = state.profile.clone().ok_or(StateError::NotStarted)?;
        info!(
            progress = profile.progress,
            stage = ?profile.stage,
            turns = profile.user_turns(),
            "User turn recorded"
        );
        Ok(profile)
    }

    /// Returns a copy of the dialogue, if one exists.
    pub fn current_profile(&self) -> Option<Profile> {
        lock_state(&self.state).profile.clone()
    }

    /// True while a start or turn is waiting on the gateway.
    pub fn is_thinking(&self) -> bool {
        lock_state(&self.state).in_flight.is_some()
    }

    /// Discards the dialogue. Calls still in flight resolve as superseded.
    pub fn reset(&self) {
        let mut state = lock_state(&self.state);
        state.epoch += 1;
        state.profile = None;
        state.in_flight = None;
        state.completion_announced = false;
        let _ = self.events.send(ConversationEvent::Reset);
        info!(epoch = state.epoch, "Elicitation dialogue reset");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    fn mark_complete(&self, state: &mut DialogueState) {
        if let Some(profile) = state.profile.as_mut() {
            profile.stage = Stage::Complete;
            profile.completed_at = Some(Utc::now());
        }
        if !state.completion_announced {
            state.completion_announced = true;
            let _ = self.events.send(ConversationEvent::Completed);
            info!("Elicitation dialogue complete");
        }
    }

    /// A failure observed after `reset()` is reported as superseded.
    fn stale_or(&self, epoch: u64, err: AppError) -> AppError {
        if lock_state(&self.state).epoch != epoch {
            StateError::Superseded.into()
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::gateway::testing::{reply, ScriptedGateway};
    use crate::gateway::GatewayError;

    fn setup() -> (Arc<ScriptedGateway>, Arc<ConversationOrchestrator>) {
        let gateway = Arc::new(ScriptedGateway::new());
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            gateway.clone(),
            Duration::from_secs(30),
        ));
        (gateway, orchestrator)
    }

    async fn wait_until_thinking(orchestrator: &ConversationOrchestrator) {
        while !orchestrator.is_thinking() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_takes_progress_from_gateway() {
        let (gateway, orchestrator) = setup();
        gateway.push_elicit(Ok(reply("Hi! What kind of work do you do?", 20, false)));

        let profile = orchestrator.start("en").await.unwrap();

        assert_eq!(profile.stage, Stage::InProgress);
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.history[0].speaker, Speaker::Assistant);
        assert_eq!(orchestrator.current_profile().unwrap().progress, 20);
        assert_eq!(gateway.elicit_log()[0].message, "");
    }

    #[tokio::test]
    async fn test_start_twice_rejects_already_active() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        let before = orchestrator.current_profile().unwrap();

        let err = orchestrator.start("en").await.unwrap_err();

        assert!(matches!(err, AppError::State(StateError::AlreadyActive)));
        assert_eq!(orchestrator.current_profile().unwrap(), before);
        assert_eq!(gateway.elicit_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_creates_no_profile() {
        let (gateway, orchestrator) = setup();
        gateway.push_elicit(Err(GatewayError::Unavailable("refused".to_string())));

        let err = orchestrator.start("en").await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(orchestrator.current_profile().is_none());
        assert!(!orchestrator.is_thinking());
        orchestrator.start("en").await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_turn_rejected_without_gateway_call() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();

        let err = orchestrator.submit_turn("   \n").await.unwrap_err();

        assert!(matches!(err, AppError::Input(InputError::EmptyInput)));
        assert_eq!(gateway.elicit_calls(), 1);
        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_turn_before_start_rejected() {
        let (_gateway, orchestrator) = setup();
        let err = orchestrator.submit_turn("hello").await.unwrap_err();
        assert!(matches!(err, AppError::State(StateError::NotStarted)));
    }

    #[tokio::test]
    async fn test_turn_appends_user_and_assistant() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("fr").await.unwrap();
        gateway.push_elicit(Ok(reply("Which languages do you use?", 35, false)));

        let profile = orchestrator.submit_turn("  I build backends  ").await.unwrap();

        assert_eq!(profile.history.len(), 3);
        assert_eq!(profile.history[1].speaker, Speaker::User);
        assert_eq!(profile.history[1].text, "I build backends");
        assert_eq!(profile.history[2].speaker, Speaker::Assistant);
        assert_eq!(profile.progress, 35);
        assert_eq!(profile.sub_stage.as_deref(), Some("skills"));

        let call = &gateway.elicit_log()[1];
        assert_eq!(call.message, "I build backends");
        assert_eq!(call.history_len, 1);
        assert_eq!(call.locale, "fr");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_history_unchanged() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        let before = orchestrator.current_profile().unwrap();
        gateway.set_latency(Duration::from_secs(3600));

        let err = orchestrator
            .submit_turn_within("hello", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Gateway(GatewayError::Timeout(_))));
        assert!(err.is_retry_safe());
        assert_eq!(orchestrator.current_profile().unwrap(), before);
        assert!(!orchestrator.is_thinking());
    }

    #[tokio::test]
    async fn test_history_length_tracks_successful_turns() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();

        let outcomes = [true, false, true, false, false, true];
        let mut successes = 0;
        for ok in outcomes {
            if ok {
                gateway.push_elicit(Ok(reply("Noted.", 10, false)));
            } else {
                gateway.push_elicit(Err(GatewayError::Server {
                    status: 502,
                    message: "bad gateway".to_string(),
                }));
            }
            if orchestrator.submit_turn("same text").await.is_ok() {
                successes += 1;
            }
            let len = orchestrator.current_profile().unwrap().history.len();
            assert_eq!(len, 2 * successes + 1);
        }
        assert_eq!(successes, 3);
    }

    #[tokio::test]
    async fn test_terminal_rejection_rolls_back() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        gateway.push_elicit(Err(GatewayError::Rejected {
            status: 400,
            message: "message too long".to_string(),
        }));

        let err = orchestrator.submit_turn("hello").await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Terminal);
        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reply_rolls_back() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        gateway.push_elicit(Ok(reply("", 50, false)));

        let err = orchestrator.submit_turn("hello").await.unwrap_err();

        assert!(matches!(
            err,
            AppError::Gateway(GatewayError::InvalidResponse(_))
        ));
        let profile = orchestrator.current_profile().unwrap();
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.progress, 0);
    }

    #[tokio::test]
    async fn test_completion_emits_once_and_freezes_dialogue() {
        let (gateway, orchestrator) = setup();
        let mut events = orchestrator.subscribe();
        orchestrator.start("en").await.unwrap();
        gateway.push_elicit(Ok(reply("All set, thanks!", 100, true)));

        let profile = orchestrator.submit_turn("remote only").await.unwrap();
        assert_eq!(profile.stage, Stage::Complete);
        assert!(profile.completed_at.is_some());

        let err = orchestrator.submit_turn("one more thing").await.unwrap_err();
        assert!(matches!(err, AppError::State(StateError::AlreadyComplete)));
        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 3);
        assert_eq!(gateway.elicit_calls(), 2);

        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if event == ConversationEvent::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_start_after_completion_requires_reset() {
        let (gateway, orchestrator) = setup();
        let mut events = orchestrator.subscribe();
        gateway.push_elicit(Ok(reply("Hello", 0, false)));
        gateway.push_elicit(Ok(reply("Done", 100, true)));
        orchestrator.start("en").await.unwrap();
        let completed = orchestrator.submit_turn("hi").await.unwrap();

        gateway.push_elicit(Ok(reply("Welcome back", 5, false)));
        let err = orchestrator.start("en").await.unwrap_err();

        assert!(matches!(err, AppError::State(StateError::AlreadyComplete)));
        assert_eq!(orchestrator.current_profile().unwrap(), completed);
        assert_eq!(completed.progress, 100);
        assert_eq!(gateway.elicit_calls(), 2);

        orchestrator.reset();
        let profile = orchestrator.start("en").await.unwrap();
        assert_eq!(profile.stage, Stage::InProgress);
        assert_eq!(profile.progress, 5);

        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if event == ConversationEvent::Completed {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (gateway, orchestrator) = setup();
        gateway.push_elicit(Ok(reply("Hi", 40, false)));
        orchestrator.start("en").await.unwrap();
        gateway.push_elicit(Ok(reply("Hmm", 10, false)));

        let profile = orchestrator.submit_turn("hello").await.unwrap();

        assert_eq!(profile.progress, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_turn_rejected() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        gateway.set_latency(Duration::from_secs(1));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.submit_turn("first").await }
        });
        wait_until_thinking(&orchestrator).await;

        let err = orchestrator.submit_turn("second").await.unwrap_err();
        assert!(matches!(err, AppError::State(StateError::TurnInFlight)));

        let profile = first.await.unwrap().unwrap();
        assert_eq!(profile.history.len(), 3);
        assert_eq!(profile.history[1].text, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_turn_rolls_back() {
        let (gateway, orchestrator) = setup();
        orchestrator.start("en").await.unwrap();
        gateway.set_latency(Duration::from_secs(60));

        let pending = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.submit_turn("hello").await }
        });
        wait_until_thinking(&orchestrator).await;
        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 2);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 1);
        assert!(!orchestrator.is_thinking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_supersedes_turn_in_flight() {
        let (gateway, orchestrator) = setup();
        let mut events = orchestrator.subscribe();
        orchestrator.start("en").await.unwrap();
        gateway.set_latency(Duration::from_secs(1));

        let pending = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.submit_turn("hello").await }
        });
        wait_until_thinking(&orchestrator).await;
        orchestrator.reset();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::State(StateError::Superseded)));
        assert!(orchestrator.current_profile().is_none());

        let mut saw_reset = false;
        while let Ok(event) = events.try_recv() {
            saw_reset |= event == ConversationEvent::Reset;
        }
        assert!(saw_reset);

        gateway.set_latency(Duration::ZERO);
        orchestrator.start("en").await.unwrap();
        assert_eq!(orchestrator.current_profile().unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_opening_turn_may_complete_immediately() {
        let (gateway, orchestrator) = setup();
        let mut events = orchestrator.subscribe();
        gateway.push_elicit(Ok(reply("Your profile is already complete.", 100, true)));

        let profile = orchestrator.start("en").await.unwrap();

        assert_eq!(profile.stage, Stage::Complete);
        assert_eq!(
            events.try_recv().unwrap(),
            ConversationEvent::Started { progress: 100 }
        );
        assert_eq!(events.try_recv().unwrap(), ConversationEvent::Completed);
    }
}
