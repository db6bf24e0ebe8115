//! Position bookkeeping for the active context window.

use crate::model::Token;
use tracing::debug;

/// Counters threaded through every generation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationState {
    /// Tokens already evaluated in the active window.
    pub n_past: usize,
    /// Tokens already validated against the session record.
    pub n_session_consumed: usize,
}

/// Capacity of the context window and what survives a rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub n_ctx: usize,
    /// Length of the fixed prompt prefix.
    pub n_keep: usize,
    /// Recent history tokens replayed after a rollover.
    pub n_prev: usize,
}

impl ContextWindow {
    pub fn needs_rollover(&self, state: &GenerationState, pending: usize) -> bool {
        state.n_past + pending > self.n_ctx
    }

    /// Restart the window after the prompt prefix.
    ///
    /// `history` is cut back to the prefix and the last `n_prev` tokens after
    /// the prefix are moved to the front of `batch`, so that once the batch is
    /// evaluated and appended, `history` again mirrors the window contents.
    /// Returns the number of replayed tokens.
    pub fn roll_over(
        &self,
        state: &mut GenerationState,
        history: &mut Vec<Token>,
        batch: &mut Vec<Token>,
    ) -> usize {
        let keep = self.n_keep.min(history.len());
        let n_replay = self.n_prev.min(history.len() - keep);
        let replay = history.split_off(history.len() - n_replay);
        history.truncate(keep);

        batch.splice(0..0, replay);
        state.n_past = keep;

        debug!(
            "context rollover: n_past reset to {}, replaying {} tokens ahead of {} pending",
            keep,
            n_replay,
            batch.len() - n_replay
        );
        n_replay
    }
}
