//! Conversation state machine
//!
//! The authoritative model of which phase a conversation is in. Every
//! transition is checked against a fixed edge table; rejected transitions
//! leave the state untouched.
//!
//! ```text
//! Disconnected → Connecting → Connected → Listening ⇄ Recording → Processing
//!                                             ↑  ↘                    ↓
//!                                             └── Playing ←──────────┘
//!                                                    └→ Recording (interruption)
//! any → Error → {Disconnected, Connecting, Connected}
//! ```

use crate::clock::Clock;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Transition history is trimmed once it grows past this many records...
pub const HISTORY_CAP: usize = 50;
/// ...down to this many of the most recent ones.
pub const HISTORY_RETAIN: usize = 25;

/// Phase of a conversation. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Recording,
    Processing,
    Playing,
    Error,
    Disconnecting,
}

impl ConversationState {
    pub const ALL: [ConversationState; 9] = [
        ConversationState::Disconnected,
        ConversationState::Connecting,
        ConversationState::Connected,
        ConversationState::Listening,
        ConversationState::Recording,
        ConversationState::Processing,
        ConversationState::Playing,
        ConversationState::Error,
        ConversationState::Disconnecting,
    ];

    /// Allowed targets from this state, excluding the universal `Error` edge
    pub fn allowed_targets(self) -> &'static [ConversationState] {
        use ConversationState::*;
        match self {
            Disconnected => &[Connecting],
            Connecting => &[Connected, Disconnected],
            Connected => &[Listening, Disconnecting],
            Listening => &[Recording, Playing, Disconnecting],
            Recording => &[Processing, Listening],
            Processing => &[Playing, Listening],
            Playing => &[Listening, Recording],
            Error => &[Disconnected, Connecting, Connected],
            Disconnecting => &[Disconnected],
        }
    }

    pub fn can_transition_to(self, to: ConversationState) -> bool {
        to == ConversationState::Error || self.allowed_targets().contains(&to)
    }

    /// Connected through Playing: a live session exists
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConversationState::Connected
                | ConversationState::Listening
                | ConversationState::Recording
                | ConversationState::Processing
                | ConversationState::Playing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Disconnected => "disconnected",
            ConversationState::Connecting => "connecting",
            ConversationState::Connected => "connected",
            ConversationState::Listening => "listening",
            ConversationState::Recording => "recording",
            ConversationState::Processing => "processing",
            ConversationState::Playing => "playing",
            ConversationState::Error => "error",
            ConversationState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain events fed into [`ConversationStateMachine::handle_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    ConnectRequested,
    ConnectionEstablished,
    SessionStarted,
    SpeechDetected,
    SpeechEnded,
    AudioSent,
    ResponseReceived,
    AudioPlaying,
    AudioFinished,
    UserInterrupted,
    ErrorOccurred,
    DisconnectRequested,
    Disconnected,
}

impl StateEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            StateEvent::ConnectRequested => "connect_requested",
            StateEvent::ConnectionEstablished => "connection_established",
            StateEvent::SessionStarted => "session_started",
            StateEvent::SpeechDetected => "speech_detected",
            StateEvent::SpeechEnded => "speech_ended",
            StateEvent::AudioSent => "audio_sent",
            StateEvent::ResponseReceived => "response_received",
            StateEvent::AudioPlaying => "audio_playing",
            StateEvent::AudioFinished => "audio_finished",
            StateEvent::UserInterrupted => "user_interrupted",
            StateEvent::ErrorOccurred => "error_occurred",
            StateEvent::DisconnectRequested => "disconnect_requested",
            StateEvent::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ConversationState,
    pub to: ConversationState,
    pub trigger: String,
    pub timestamp_millis: u64,
    pub metadata: Option<Value>,
}

/// Outcome of an applied transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: ConversationState,
    pub to: ConversationState,
    pub trigger: String,
    /// Set when `Playing → Recording` was taken on user speech
    pub interrupted: bool,
    pub error_count: u32,
}

/// Snapshot of the machine for UI shells
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateInfo {
    pub current: ConversationState,
    pub previous: Option<ConversationState>,
    pub entered_at_millis: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub is_idle: bool,
    pub is_connecting: bool,
    pub is_active: bool,
    pub is_listening: bool,
    pub is_recording: bool,
    pub is_processing: bool,
    pub is_playing: bool,
    pub has_error: bool,
}

/// Validating state machine for one conversation
#[derive(Debug)]
pub struct ConversationStateMachine {
    current: ConversationState,
    previous: Option<ConversationState>,
    entered_at_millis: u64,
    error_count: u32,
    last_error: Option<String>,
    history: Vec<TransitionRecord>,
    clock: Arc<dyn Clock>,
}

impl ConversationStateMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let entered_at_millis = clock.now_millis();
        Self {
            current: ConversationState::Disconnected,
            previous: None,
            entered_at_millis,
            error_count: 0,
            last_error: None,
            history: Vec::new(),
            clock,
        }
    }

    pub fn current_state(&self) -> ConversationState {
        self.current
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Apply `to` if the edge table allows it
    pub fn transition_to(&mut self, to: ConversationState) -> bool {
        self.try_transition(to, "direct", None).is_ok()
    }

    /// Apply `to` with a trigger label, reporting rejection as
    /// [`VoiceError::InvalidTransition`].
    ///
    /// Entering `Error` increments the error counter. Entering `Connecting`
    /// keeps it; every other state clears it.
    pub fn try_transition(
        &mut self,
        to: ConversationState,
        trigger: &str,
        metadata: Option<Value>,
    ) -> VoiceResult<StateChange> {
        let from = self.current;
        if !from.can_transition_to(to) {
            error!("❌ State transition error: {} → {} ({})", from, to, trigger);
            return Err(VoiceError::InvalidTransition { from, to });
        }

        let now = self.clock.now_millis();
        if to == ConversationState::Error {
            self.error_count += 1;
            self.last_error = metadata
                .as_ref()
                .and_then(|m| m.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
        } else if to != ConversationState::Connecting {
            // A reconnect attempt is not yet a success; the counter survives it.
            self.error_count = 0;
            self.last_error = None;
        }

        self.previous = Some(from);
        self.current = to;
        self.entered_at_millis = now;
        self.history.push(TransitionRecord {
            from,
            to,
            trigger: trigger.to_string(),
            timestamp_millis: now,
            metadata,
        });
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_RETAIN;
            self.history.drain(..excess);
        }

        info!("🔄 State: {} → {} ({})", from, to, trigger);

        Ok(StateChange {
            from,
            to,
            trigger: trigger.to_string(),
            interrupted: trigger == StateEvent::UserInterrupted.as_str(),
            error_count: self.error_count,
        })
    }

    /// Map a domain event onto at most one transition.
    ///
    /// Events with no edge from the current state are logged and dropped.
    pub fn handle_event(
        &mut self,
        event: StateEvent,
        metadata: Option<Value>,
    ) -> Option<StateChange> {
        use ConversationState as S;
        debug!("📨 Handling event: {} in state: {}", event, self.current);

        let (target, trigger) = match (event, self.current) {
            (StateEvent::ConnectRequested, S::Disconnected | S::Error) => (S::Connecting, event),
            (StateEvent::ConnectionEstablished, S::Connecting) => (S::Connected, event),
            (StateEvent::SessionStarted, S::Connected) => (S::Listening, event),
            (StateEvent::SpeechDetected, S::Listening) => (S::Recording, event),
            (StateEvent::SpeechDetected | StateEvent::UserInterrupted, S::Playing) => {
                (S::Recording, StateEvent::UserInterrupted)
            }
            (StateEvent::SpeechEnded, S::Recording) => (S::Processing, event),
            (StateEvent::ResponseReceived, S::Processing) => (S::Playing, event),
            (StateEvent::AudioFinished, S::Playing) => (S::Listening, event),
            (StateEvent::ErrorOccurred, _) => (S::Error, event),
            (StateEvent::DisconnectRequested, current) if current != S::Disconnected => {
                (S::Disconnecting, event)
            }
            (StateEvent::Disconnected, S::Disconnecting | S::Error | S::Connecting) => {
                (S::Disconnected, event)
            }
            (StateEvent::AudioSent | StateEvent::AudioPlaying, current) => {
                debug!("📨 {} acknowledged in {}", event, current);
                return None;
            }
            (_, current) => {
                warn!("⚠️ Unhandled event: {} in state: {}", event, current);
                return None;
            }
        };

        self.try_transition(target, trigger.as_str(), metadata).ok()
    }

    /// Unconditionally return to `Disconnected` and clear error tracking
    pub fn reset(&mut self) {
        info!("🔄 Resetting conversation state machine");
        self.previous = Some(self.current);
        self.current = ConversationState::Disconnected;
        self.entered_at_millis = self.clock.now_millis();
        self.error_count = 0;
        self.last_error = None;
    }

    /// Override the current state without validation, for operator recovery
    pub fn force_state(&mut self, state: ConversationState, reason: &str) -> StateChange {
        warn!("⚠️ Force transitioning to state: {} ({})", state, reason);
        let from = self.current;
        let now = self.clock.now_millis();
        self.previous = Some(from);
        self.current = state;
        self.entered_at_millis = now;
        self.history.push(TransitionRecord {
            from,
            to: state,
            trigger: "force_transition".to_string(),
            timestamp_millis: now,
            metadata: Some(serde_json::json!({ "reason": reason })),
        });
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_RETAIN;
            self.history.drain(..excess);
        }
        StateChange {
            from,
            to: state,
            trigger: "force_transition".to_string(),
            interrupted: false,
            error_count: self.error_count,
        }
    }

    pub fn state_info(&self) -> StateInfo {
        use ConversationState as S;
        let current = self.current;
        StateInfo {
            current,
            previous: self.previous,
            entered_at_millis: self.entered_at_millis,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            is_idle: current == S::Disconnected,
            is_connecting: current == S::Connecting,
            is_active: current.is_active(),
            is_listening: current == S::Listening,
            is_recording: current == S::Recording,
            is_processing: current == S::Processing,
            is_playing: current == S::Playing,
            has_error: current == S::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn machine() -> ConversationStateMachine {
        ConversationStateMachine::new(Arc::new(ManualClock::new(0)))
    }

    fn drive_to_listening(sm: &mut ConversationStateMachine) {
        sm.handle_event(StateEvent::ConnectRequested, None);
        sm.handle_event(StateEvent::ConnectionEstablished, None);
        sm.handle_event(StateEvent::SessionStarted, None);
        assert_eq!(sm.current_state(), ConversationState::Listening);
    }

    #[test]
    fn test_happy_path_turn() {
        let mut sm = machine();
        drive_to_listening(&mut sm);

        sm.handle_event(StateEvent::SpeechDetected, None);
        assert_eq!(sm.current_state(), ConversationState::Recording);
        sm.handle_event(StateEvent::SpeechEnded, None);
        assert_eq!(sm.current_state(), ConversationState::Processing);
        assert!(sm.handle_event(StateEvent::AudioSent, None).is_none());
        sm.handle_event(StateEvent::ResponseReceived, None);
        assert_eq!(sm.current_state(), ConversationState::Playing);
        sm.handle_event(StateEvent::AudioFinished, None);
        assert_eq!(sm.current_state(), ConversationState::Listening);
    }

    #[test]
    fn test_interruption_edge_is_tagged() {
        let mut sm = machine();
        drive_to_listening(&mut sm);
        sm.handle_event(StateEvent::SpeechDetected, None);
        sm.handle_event(StateEvent::SpeechEnded, None);
        sm.handle_event(StateEvent::ResponseReceived, None);

        let change = sm
            .handle_event(StateEvent::SpeechDetected, None)
            .expect("interruption applies");
        assert!(change.interrupted);
        assert_eq!(change.trigger, "user_interrupted");
        assert_eq!(sm.current_state(), ConversationState::Recording);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut sm = machine();
        assert!(!sm.transition_to(ConversationState::Playing));
        assert_eq!(sm.current_state(), ConversationState::Disconnected);

        let err = sm
            .try_transition(ConversationState::Recording, "test", None)
            .unwrap_err();
        assert!(matches!(err, VoiceError::InvalidTransition { .. }));
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_unmatched_event_is_dropped() {
        let mut sm = machine();
        assert!(sm.handle_event(StateEvent::SpeechEnded, None).is_none());
        assert!(sm.handle_event(StateEvent::AudioFinished, None).is_none());
        assert_eq!(sm.current_state(), ConversationState::Disconnected);
    }

    #[test]
    fn test_every_applied_transition_is_legal() {
        let mut sm = machine();
        let events = [
            StateEvent::SpeechDetected,
            StateEvent::ConnectRequested,
            StateEvent::SessionStarted,
            StateEvent::ConnectionEstablished,
            StateEvent::ResponseReceived,
            StateEvent::SessionStarted,
            StateEvent::SpeechDetected,
            StateEvent::AudioFinished,
            StateEvent::SpeechEnded,
            StateEvent::ErrorOccurred,
            StateEvent::SpeechDetected,
            StateEvent::ConnectRequested,
            StateEvent::DisconnectRequested,
            StateEvent::Disconnected,
        ];
        for _ in 0..5 {
            for event in events {
                sm.handle_event(event, None);
                assert!(ConversationState::ALL.contains(&sm.current_state()));
            }
        }
        for record in sm.history() {
            assert!(
                record.from.can_transition_to(record.to),
                "illegal edge {} -> {}",
                record.from,
                record.to
            );
        }
    }

    #[test]
    fn test_error_counter_survives_reconnect_attempts() {
        let mut sm = machine();
        sm.handle_event(StateEvent::ConnectRequested, None);
        for expected in 1..=3 {
            let change = sm
                .handle_event(StateEvent::ErrorOccurred, Some(json!({ "error": "refused" })))
                .expect("error edge always applies");
            assert_eq!(change.error_count, expected);
            sm.handle_event(StateEvent::ConnectRequested, None);
            assert_eq!(sm.current_state(), ConversationState::Connecting);
        }
        assert_eq!(sm.error_count(), 3);

        sm.handle_event(StateEvent::ConnectionEstablished, None);
        assert_eq!(sm.error_count(), 0);
    }

    #[test]
    fn test_last_error_is_recorded() {
        let mut sm = machine();
        sm.handle_event(StateEvent::ErrorOccurred, Some(json!({ "error": "socket closed" })));
        let info = sm.state_info();
        assert!(info.has_error);
        assert_eq!(info.error_count, 1);
        assert_eq!(info.last_error.as_deref(), Some("socket closed"));
        assert_eq!(info.previous, Some(ConversationState::Disconnected));
    }

    #[test]
    fn test_history_is_trimmed() {
        let mut sm = machine();
        // Error -> Error is always allowed
        for _ in 0..HISTORY_CAP {
            sm.handle_event(StateEvent::ErrorOccurred, None);
        }
        assert_eq!(sm.history().len(), HISTORY_CAP);

        sm.handle_event(StateEvent::ErrorOccurred, None);
        assert_eq!(sm.history().len(), HISTORY_RETAIN);
    }

    #[test]
    fn test_reset_and_force_state() {
        let clock = ManualClock::new(100);
        let mut sm = ConversationStateMachine::new(Arc::new(clock.clone()));
        drive_to_listening(&mut sm);
        sm.handle_event(StateEvent::ErrorOccurred, None);

        clock.advance(50);
        sm.reset();
        let info = sm.state_info();
        assert!(info.is_idle);
        assert_eq!(info.error_count, 0);
        assert_eq!(info.entered_at_millis, 150);

        let change = sm.force_state(ConversationState::Playing, "operator");
        assert_eq!(change.from, ConversationState::Disconnected);
        assert!(sm.state_info().is_playing);
    }

    #[test]
    fn test_disconnect_requires_an_edge() {
        let mut sm = machine();
        drive_to_listening(&mut sm);
        sm.handle_event(StateEvent::SpeechDetected, None);

        // Recording has no edge to Disconnecting
        assert!(sm.handle_event(StateEvent::DisconnectRequested, None).is_none());
        assert!(sm.transition_to(ConversationState::Listening));
        assert!(sm.handle_event(StateEvent::DisconnectRequested, None).is_some());
        sm.handle_event(StateEvent::Disconnected, None);
        assert_eq!(sm.current_state(), ConversationState::Disconnected);
    }
}
