//! "Newest request wins" for callers that re-request faster than results
//! arrive.
//!
//! A gate hands out tickets from a revision counter. Issuing a new ticket
//! supersedes every earlier one, and a result that arrives with a superseded
//! ticket is dropped instead of being applied. The cache underneath is still
//! populated by the stale computation.

use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket {
    revision: u64,
}

impl RequestTicket {
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// One gate per consumer, e.g. per dashboard widget.
#[derive(Debug, Default)]
pub struct RequestGate {
    revision: AtomicU64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new request, superseding all earlier tickets.
    pub fn issue(&self) -> RequestTicket {
        RequestTicket {
            revision: self.revision.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn is_current(&self, ticket: &RequestTicket) -> bool {
        ticket.revision == self.revision.load(Ordering::SeqCst)
    }

    /// Hands `value` back only if no newer request was issued meanwhile.
    pub fn accept<T>(&self, ticket: &RequestTicket, value: T) -> Option<T> {
        if self.is_current(ticket) {
            Some(value)
        } else {
            debug!("Discarding result of stale request {}", ticket.revision);
            None
        }
    }

    /// Issues a ticket, awaits `request`, and returns its output unless a
    /// newer request was issued while it ran.
    pub async fn run_latest<Fut>(&self, request: Fut) -> Option<Fut::Output>
    where
        Fut: Future,
    {
        let ticket = self.issue();
        let output = request.await;
        self.accept(&ticket, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_newer_ticket_supersedes_older() {
        let gate = RequestGate::new();
        let first = gate.issue();
        assert!(gate.is_current(&first));

        let second = gate.issue();
        assert!(!gate.is_current(&first));
        assert_eq!(gate.accept(&first, 1), None);
        assert_eq!(gate.accept(&second, 2), Some(2));
        assert!(second.revision() > first.revision());
    }

    #[tokio::test]
    async fn test_slow_stale_request_is_discarded() {
        let gate = RequestGate::new();

        let slow = gate.run_latest(async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            "old parameters"
        });
        let fast = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            gate.run_latest(async { "new parameters" }).await
        };

        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow, None);
        assert_eq!(fast, Some("new parameters"));
    }
}
