use std::collections::HashSet;

use crate::protocol::IceCandidate;

/// Per-peer trickle ICE buffer.
///
/// Outbound candidates are those discovered locally; they wait until the remote
/// description is applied so the peer can use them. Inbound candidates are those
/// relayed from the peer; they wait until this side has a remote description.
/// Both queues preserve discovery order.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    outbound: Vec<IceCandidate>,
    inbound: Vec<IceCandidate>,
    applied: HashSet<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_outbound(&mut self, candidate: IceCandidate) {
        self.outbound.push(candidate);
    }

    /// Drains queued local candidates in discovery order.
    pub fn take_outbound(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.outbound)
    }

    /// Queues a remote candidate. Returns `false` when the candidate is already
    /// queued or was applied to the current connection.
    pub fn queue_inbound(&mut self, candidate: IceCandidate) -> bool {
        if self.applied.contains(&candidate) || self.inbound.contains(&candidate) {
            return false;
        }
        self.inbound.push(candidate);
        true
    }

    pub fn take_inbound(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.inbound)
    }

    pub fn is_applied(&self, candidate: &IceCandidate) -> bool {
        self.applied.contains(candidate)
    }

    pub fn mark_applied(&mut self, candidate: IceCandidate) -> bool {
        self.applied.insert(candidate)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Forgets everything tied to the connection being replaced. Remote
    /// candidates still queued were gathered for the peer's previous attempt,
    /// which the peer replaces too, so they go with it. Returns how many
    /// candidates were dropped.
    pub fn reset_for_new_connection(&mut self) -> usize {
        let dropped = self.outbound.len() + self.inbound.len();
        self.outbound.clear();
        self.inbound.clear();
        self.applied.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn outbound_drains_in_discovery_order_and_clears() {
        let mut buffer = CandidateBuffer::new();
        buffer.queue_outbound(candidate(1));
        buffer.queue_outbound(candidate(2));
        buffer.queue_outbound(candidate(3));

        assert_eq!(
            buffer.take_outbound(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert_eq!(buffer.outbound_len(), 0);
        assert!(buffer.take_outbound().is_empty());
    }

    #[test]
    fn inbound_skips_duplicates_and_applied_candidates() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.queue_inbound(candidate(1)));
        assert!(!buffer.queue_inbound(candidate(1)));

        assert!(buffer.mark_applied(candidate(2)));
        assert!(!buffer.mark_applied(candidate(2)));
        assert!(!buffer.queue_inbound(candidate(2)));

        assert_eq!(buffer.take_inbound(), vec![candidate(1)]);
    }

    #[test]
    fn reset_drops_everything_tied_to_the_old_connection() {
        let mut buffer = CandidateBuffer::new();
        buffer.queue_outbound(candidate(1));
        buffer.queue_inbound(candidate(2));
        buffer.mark_applied(candidate(3));

        assert_eq!(buffer.reset_for_new_connection(), 2);
        assert_eq!(buffer.outbound_len(), 0);
        assert_eq!(buffer.inbound_len(), 0);
        assert!(!buffer.is_applied(&candidate(3)));
        // The same candidate may be applied again to the next connection.
        assert!(buffer.queue_inbound(candidate(3)));
    }
}
