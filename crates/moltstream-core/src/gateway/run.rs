//! Run tracking and delta computation.
//!
//! The gateway reports the *cumulative* reply text of a run on every chat
//! event. [`RunTracker`] remembers the last cumulative string of the active
//! run and turns each event into the newly appended suffix.

use super::frames::{ChatEvent, ChatState};

/// Text to forward for one chat event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delta: String,
    pub done: bool,
}

/// Cumulative content that does not extend what was already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonExtendingContent {
    pub run_id: String,
    pub previous_len: usize,
    pub current_len: usize,
}

impl std::fmt::Display for NonExtendingContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {}: cumulative content ({} bytes) does not extend previous content ({} bytes)",
            self.run_id, self.current_len, self.previous_len
        )
    }
}

/// Per-connection run bookkeeping.
///
/// Holds the request id of an unacknowledged `chat.send`, the active run id
/// once the gateway acknowledged it, and the last cumulative content seen
/// for that run.
#[derive(Debug, Default)]
pub struct RunTracker {
    pending_send: Option<String>,
    active_run: Option<String>,
    last_seen: String,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `chat.send` is awaiting its ack, or a run is streaming.
    pub fn is_busy(&self) -> bool {
        self.pending_send.is_some() || self.active_run.is_some()
    }

    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    pub fn pending_send(&self) -> Option<&str> {
        self.pending_send.as_deref()
    }

    /// Record the request id of a `chat.send` just written to the socket.
    pub fn begin_send(&mut self, request_id: impl Into<String>) {
        self.pending_send = Some(request_id.into());
        self.active_run = None;
        self.last_seen.clear();
    }

    /// True when `request_id` is the outstanding `chat.send`.
    pub fn is_pending_send(&self, request_id: &str) -> bool {
        self.pending_send.as_deref() == Some(request_id)
    }

    /// The gateway acknowledged the pending send with `run_id`.
    pub fn acknowledge(&mut self, run_id: impl Into<String>) {
        self.pending_send = None;
        self.active_run = Some(run_id.into());
        self.last_seen.clear();
    }

    /// Forget the pending send and any active run.
    pub fn clear(&mut self) {
        self.pending_send = None;
        self.active_run = None;
        self.last_seen.clear();
    }

    /// Reduce a chat event to a delivery.
    ///
    /// `Ok(None)` for events of any other run (or when no run is active) and
    /// for non-terminal events that add no text. A terminal state clears the
    /// active run. An `error` state delivers the gateway's error text instead
    /// of a content delta. Non-extending content clears the run and is
    /// returned as an error.
    pub fn apply(&mut self, event: &ChatEvent) -> Result<Option<Delivery>, NonExtendingContent> {
        if self.active_run.as_deref() != Some(event.run_id.as_str()) {
            return Ok(None);
        }

        let done = event.state.is_terminal();

        if event.state == ChatState::Error {
            self.clear();
            let message = event
                .error_message
                .clone()
                .unwrap_or_else(|| "run failed".to_string());
            return Ok(Some(Delivery {
                delta: message,
                done: true,
            }));
        }

        let delta = match event.text() {
            Some(cumulative) => self.advance(&event.run_id, cumulative)?,
            None => String::new(),
        };

        if done {
            self.clear();
        } else if delta.is_empty() {
            return Ok(None);
        }

        Ok(Some(Delivery { delta, done }))
    }

    fn advance(&mut self, run_id: &str, cumulative: String) -> Result<String, NonExtendingContent> {
        match cumulative.strip_prefix(self.last_seen.as_str()) {
            Some(suffix) => {
                let delta = suffix.to_string();
                self.last_seen = cumulative;
                Ok(delta)
            }
            None => {
                let err = NonExtendingContent {
                    run_id: run_id.to_string(),
                    previous_len: self.last_seen.len(),
                    current_len: cumulative.len(),
                };
                self.clear();
                Err(err)
            }
        }
    }
}
