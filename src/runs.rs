//! Active run tracking.
//!
//! A run is one streamed assistant response. The gateway is loose about
//! naming them: the `chat.send` acknowledgment may carry a provisional ID,
//! streamed events may use an ID derived from the idempotency key, and some
//! events arrive before any ID has been seen at all. [`RunTracker`] owns
//! the map of live runs and resolves every incoming event to one of them:
//!
//! 1. exact ID match,
//! 2. a run whose conversation ID prefixes the incoming run ID (the run is
//!    re-keyed to the gateway's ID),
//! 3. adopting the oldest pending chat request.
//!
//! Events that resolve to no run are dropped. Runs survive reconnects, so
//! a response that started streaming before a drop can finish after it.

use std::collections::HashMap;

use crate::correlator::RequestCorrelator;

/// One streamed response in progress.
#[derive(Debug)]
pub struct RunState {
    /// Conversation that started the run.
    pub conversation_id: String,
    /// Request the run answers.
    pub request_id: String,
    /// Assistant text received so far.
    pub accumulated: String,
}

/// Progress report for a delta applied to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaProgress {
    /// Conversation that started the run.
    pub conversation_id: String,
    /// All text received for the run so far.
    pub accumulated: String,
}

/// A run removed from the tracker on completion or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    /// Conversation that started the run.
    pub conversation_id: String,
    /// Request the run answered.
    pub request_id: String,
    /// Accumulated text; partial if the run failed mid-stream.
    pub text: String,
}

/// Map of live runs keyed by run ID.
#[derive(Debug, Default)]
pub struct RunTracker {
    runs: HashMap<String, RunState>,
}

impl RunTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a run named by a `chat.send` acknowledgment.
    pub fn insert(&mut self, run_id: String, request_id: String, conversation_id: String) {
        self.runs.insert(
            run_id,
            RunState {
                conversation_id,
                request_id,
                accumulated: String::new(),
            },
        );
    }

    /// Append streamed text to a run.
    ///
    /// Returns `None` when the event resolves to no run.
    pub fn apply_delta(
        &mut self,
        run_id: &str,
        delta: &str,
        pending: &RequestCorrelator,
    ) -> Option<DeltaProgress> {
        if !self.locate(run_id, pending) {
            return None;
        }
        let run = self.runs.get_mut(run_id)?;
        run.accumulated.push_str(delta);
        Some(DeltaProgress {
            conversation_id: run.conversation_id.clone(),
            accumulated: run.accumulated.clone(),
        })
    }

    /// Remove a run that ended or failed, returning what it produced.
    ///
    /// Returns `None` when the event resolves to no run.
    pub fn complete(&mut self, run_id: &str, pending: &RequestCorrelator) -> Option<CompletedRun> {
        if !self.locate(run_id, pending) {
            return None;
        }
        let run = self.runs.remove(run_id)?;
        Some(CompletedRun {
            conversation_id: run.conversation_id,
            request_id: run.request_id,
            text: run.accumulated,
        })
    }

    /// Drop every run belonging to a request, after that request was
    /// rejected or timed out.
    pub fn remove_for_request(&mut self, request_id: &str) {
        self.runs.retain(|_, run| run.request_id != request_id);
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no runs are live.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Make sure `run_id` names a tracked run, re-keying or adopting as
    /// needed. Returns `false` when nothing matches.
    fn locate(&mut self, run_id: &str, pending: &RequestCorrelator) -> bool {
        if self.runs.contains_key(run_id) {
            return true;
        }

        // Streamed run IDs are derived from the idempotency key, which the
        // conversation ID prefixes. Move a provisionally keyed run over to
        // the ID the gateway actually uses.
        let provisional = self
            .runs
            .iter()
            .filter(|(_, run)| run_id.starts_with(&run.conversation_id))
            .map(|(key, _)| key.clone())
            .min();
        if let Some(old_key) = provisional {
            if let Some(run) = self.runs.remove(&old_key) {
                log::debug!("[Gateway] Re-keyed run {} -> {}", old_key, run_id);
                self.runs.insert(run_id.to_string(), run);
            }
            return true;
        }

        // No tracked run matches: attribute the stream to the oldest chat
        // request still waiting for output.
        if let Some((request_id, conversation_id)) = pending.oldest_pending_chat() {
            log::debug!(
                "[Gateway] Adopted run {} for request {}",
                run_id,
                request_id
            );
            self.insert(run_id.to_string(), request_id, conversation_id);
            return true;
        }

        log::debug!("[Gateway] Ignoring event for unknown run {}", run_id);
        false
    }
}
