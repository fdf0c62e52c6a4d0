// libs/teleconsultation-cell/src/services/candidates.rs
use std::collections::VecDeque;
use tracing::{debug, error};

use crate::models::IceCandidate;
use crate::platform::PeerLink;

/// Remote candidates that arrived before the link had a remote description.
///
/// Scoped to one peer link incarnation: a new link gets a new buffer.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub applied: usize,
    pub failed: usize,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
        debug!("Buffered remote candidate ({} pending)", self.pending.len());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every buffered candidate in arrival order and leaves the
    /// buffer empty. Call right after a remote description was applied.
    /// A candidate the link rejects is logged and skipped.
    pub async fn flush(&mut self, link: &dyn PeerLink) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        while let Some(candidate) = self.pending.pop_front() {
            match link.add_ice_candidate(candidate).await {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    error!("Error adding queued ICE candidate: {}", e);
                    outcome.failed += 1;
                }
            }
        }

        if outcome.applied + outcome.failed > 0 {
            debug!(
                "Flushed queued candidates: {} applied, {} failed",
                outcome.applied, outcome.failed
            );
        }
        outcome
    }
}
