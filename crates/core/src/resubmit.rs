//! Decides when a conversation must be silently resent to the backend after a
//! human resolved pending tool approvals.
//!
//! The guard remembers which resolved-approval states already triggered a
//! resend so the approve → resend → respond cycle cannot loop.

use crate::message::{Role, ToolState, UiMessage};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Identity of a resolved-approval state within one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApprovalStateKey {
    pub turn_id: String,
    /// Sorted ids of the tool calls whose approval has been resolved.
    pub tool_call_ids: Vec<String>,
}

impl ApprovalStateKey {
    pub fn new(turn_id: impl Into<String>, mut tool_call_ids: Vec<String>) -> Self {
        tool_call_ids.sort();
        tool_call_ids.dedup();
        Self {
            turn_id: turn_id.into(),
            tool_call_ids,
        }
    }
}

/// Which rule of the cascade produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoAssistantTurn,
    TurnHasText,
    NothingResolved,
    ApprovalPending,
    AlreadyResent,
    ToolFailed,
    /// Every completed tool ran on the backend (`providerExecuted`), so its
    /// result is already part of the streamed reply. This rule is an addition
    /// to the base cascade: it is checked after `ToolFailed` and before the
    /// client-completed and default rules, which would otherwise resend.
    BackendAnswered,
    ClientCompleted,
    ApprovalResolved,
}

impl Verdict {
    pub fn should_resubmit(self) -> bool {
        matches!(self, Self::ClientCompleted | Self::ApprovalResolved)
    }
}

/// Auto-resubmit decision engine with its per-turn dedup cache.
#[derive(Debug, Default)]
pub struct ResubmitGuard {
    fired: HashMap<String, HashSet<ApprovalStateKey>>,
}

impl ResubmitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the conversation must be resent now.
    pub fn should_resubmit(&mut self, messages: &[UiMessage]) -> bool {
        let verdict = self.evaluate(messages);
        debug!(?verdict, "auto-resubmit decision");
        verdict.should_resubmit()
    }

    /// Same as [`ResubmitGuard::should_resubmit`] for conversation state held as
    /// raw JSON. Undecodable state never triggers a resend.
    pub fn should_resubmit_json(&mut self, messages: &serde_json::Value) -> bool {
        match serde_json::from_value::<Vec<UiMessage>>(messages.clone()) {
            Ok(messages) => self.should_resubmit(&messages),
            Err(e) => {
                warn!(error = %e, "could not decode conversation state; not resubmitting");
                false
            }
        }
    }

    /// Runs the decision cascade. First matching rule wins.
    pub fn evaluate(&mut self, messages: &[UiMessage]) -> Verdict {
        let Some(last) = messages.last() else {
            return Verdict::NoAssistantTurn;
        };
        if last.role != Role::Assistant {
            return Verdict::NoAssistantTurn;
        }

        if last.has_text() {
            if self.fired.remove(&last.id).is_some() {
                debug!(turn_id = %last.id, "assistant answered; cleared resend keys for turn");
            }
            return Verdict::TurnHasText;
        }

        let resolved: Vec<String> = last
            .tool_parts()
            .filter(|tool| tool.approval_resolved())
            .map(|tool| tool.tool_call_id.clone())
            .collect();
        if resolved.is_empty() {
            return Verdict::NothingResolved;
        }

        if last
            .tool_parts()
            .any(|tool| tool.state == ToolState::ApprovalRequested)
        {
            return Verdict::ApprovalPending;
        }

        let key = ApprovalStateKey::new(last.id.clone(), resolved);
        if self
            .fired
            .get(&last.id)
            .is_some_and(|keys| keys.contains(&key))
        {
            return Verdict::AlreadyResent;
        }

        if last
            .tool_parts()
            .any(|tool| tool.state == ToolState::OutputError)
        {
            return Verdict::ToolFailed;
        }

        let mut completed = last
            .tool_parts()
            .filter(|tool| tool.state == ToolState::OutputAvailable && tool.output.is_some())
            .peekable();
        if completed.peek().is_some() {
            if completed.any(|tool| !tool.is_provider_executed()) {
                self.record(key);
                return Verdict::ClientCompleted;
            }
            return Verdict::BackendAnswered;
        }

        self.record(key);
        Verdict::ApprovalResolved
    }

    /// Forgets every key recorded for `turn_id`. Called once a turn can no
    /// longer be the last message, such as when the user speaks again.
    pub fn evict_turn(&mut self, turn_id: &str) {
        if self.fired.remove(turn_id).is_some() {
            debug!(%turn_id, "evicted resend keys for superseded turn");
        }
    }

    pub fn has_fired(&self, key: &ApprovalStateKey) -> bool {
        self.fired
            .get(&key.turn_id)
            .is_some_and(|keys| keys.contains(key))
    }

    fn record(&mut self, key: ApprovalStateKey) {
        self.fired.entry(key.turn_id.clone()).or_default().insert(key);
    }
}
