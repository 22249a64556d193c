//! Pending ICE candidate queue
//!
//! Remote candidates can only be applied to a transport that already has a
//! remote description. Signaling gives no ordering guarantee between the
//! description and the candidates trickling around it, so early arrivals
//! wait here and are replayed in arrival order once the description lands.

use std::collections::VecDeque;

use crate::signaling::message::IceCandidate;

/// Holds remote candidates until the transport can accept them
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_ready: bool,
}

impl CandidateQueue {
    /// Create an empty queue awaiting a remote description
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether candidates can currently be applied directly
    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    /// Offer an arriving candidate
    ///
    /// Returns the candidate back when it can be applied immediately, or
    /// `None` when it was queued for later replay.
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Record that the remote description is installed
    ///
    /// Returns every queued candidate in arrival order; subsequent arrivals
    /// pass straight through `accept`.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.pending.drain(..).collect()
    }

    /// Number of candidates still waiting
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all queued candidates and await a new remote description
    ///
    /// Called on teardown and before a fresh attempt; stale candidates
    /// must never leak into the next transport.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.remote_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{}", n), Some("0".to_string()), Some(0))
    }

    #[test]
    fn test_queues_before_remote_ready() {
        let mut queue = CandidateQueue::new();
        assert!(queue.accept(candidate(1)).is_none());
        assert!(queue.accept(candidate(2)).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drains_in_arrival_order() {
        let mut queue = CandidateQueue::new();
        queue.accept(candidate(1));
        queue.accept(candidate(2));
        queue.accept(candidate(3));

        let drained = queue.mark_remote_ready();
        let lines: Vec<_> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(lines, vec!["candidate:1", "candidate:2", "candidate:3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_passes_through_after_remote_ready() {
        let mut queue = CandidateQueue::new();
        queue.mark_remote_ready();

        let returned = queue.accept(candidate(7));
        assert_eq!(returned, Some(candidate(7)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mark_remote_ready_on_empty_queue() {
        let mut queue = CandidateQueue::new();
        assert!(queue.mark_remote_ready().is_empty());
        assert!(queue.is_remote_ready());
    }

    #[test]
    fn test_reset_clears_and_requires_new_description() {
        let mut queue = CandidateQueue::new();
        queue.accept(candidate(1));
        queue.mark_remote_ready();
        queue.accept(candidate(2));

        queue.reset();
        assert!(queue.is_empty());
        assert!(!queue.is_remote_ready());

        // After reset, arrivals queue again until the next description
        assert!(queue.accept(candidate(3)).is_none());
    }
}
