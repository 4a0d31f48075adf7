//! Per-session execution ordering.
//!
//! A kernel runs one cell at a time. [`ExecutionSequencer`] keeps at most one
//! request in flight and queues the rest in submission order; a request is
//! only forwarded to the kernel when the sequencer says so.
//!
//! ```text
//!   Idle ──submit──▶ Executing(a) ──complete(a), queue empty──▶ Idle
//!                       │   ▲
//!              submit   │   │ complete(a), pop b
//!              (queue)  ▼   │
//!                    Executing(b)
//! ```

use std::collections::VecDeque;

use super::RequestId;
use crate::error::GatewayError;

/// An execute request waiting for (or being sent to) the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExecute {
    /// Request identifier echoed by the kernel.
    pub request_id: RequestId,
    /// Source code to run.
    pub code: String,
}

/// Current sequencer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerState {
    /// No request in flight.
    Idle,
    /// The given request has been forwarded and has not completed.
    Executing(RequestId),
}

/// Result of [`ExecutionSequencer::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The request must be forwarded to the kernel now.
    Forward(PendingExecute),
    /// The request was queued behind the executing one.
    Queued {
        /// 1-based position in the pending queue.
        position: usize,
    },
}

/// Result of [`ExecutionSequencer::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The next queued request must be forwarded to the kernel now.
    Next(PendingExecute),
    /// The queue is drained; the sequencer is idle.
    Idle,
    /// The completion did not match the executing request and was ignored.
    Stale,
}

/// Requests dropped by [`ExecutionSequencer::reset`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    /// The request that was executing, if any.
    pub executing: Option<RequestId>,
    /// Queued requests in submission order.
    pub pending: Vec<PendingExecute>,
}

/// FIFO execution state machine with at most one request in flight.
#[derive(Debug)]
pub struct ExecutionSequencer {
    state: SequencerState,
    pending: VecDeque<PendingExecute>,
    max_pending: usize,
}

impl ExecutionSequencer {
    /// Creates an idle sequencer that queues at most `max_pending` requests.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: SequencerState::Idle,
            pending: VecDeque::new(),
            max_pending,
        }
    }

    /// Submits a request.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the request id is already
    /// executing or queued, or if the pending queue is full.
    pub fn submit(
        &mut self,
        request_id: RequestId,
        code: String,
    ) -> Result<Submission, GatewayError> {
        if self.contains(&request_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "request {request_id} is already in flight"
            )));
        }
        let request = PendingExecute { request_id, code };
        match self.state {
            SequencerState::Idle => {
                self.state = SequencerState::Executing(request.request_id.clone());
                Ok(Submission::Forward(request))
            }
            SequencerState::Executing(_) => {
                if self.pending.len() >= self.max_pending {
                    return Err(GatewayError::InvalidRequest(format!(
                        "execution queue is full ({} pending)",
                        self.max_pending
                    )));
                }
                self.pending.push_back(request);
                Ok(Submission::Queued {
                    position: self.pending.len(),
                })
            }
        }
    }

    /// Records a completion notification from the kernel.
    pub fn complete(&mut self, request_id: &RequestId) -> Completion {
        match &self.state {
            SequencerState::Executing(current) if current == request_id => {
                match self.pending.pop_front() {
                    Some(next) => {
                        self.state = SequencerState::Executing(next.request_id.clone());
                        Completion::Next(next)
                    }
                    None => {
                        self.state = SequencerState::Idle;
                        Completion::Idle
                    }
                }
            }
            _ => Completion::Stale,
        }
    }

    /// Returns to `Idle`, handing back everything that was in flight.
    pub fn reset(&mut self) -> Drained {
        let executing = match std::mem::replace(&mut self.state, SequencerState::Idle) {
            SequencerState::Executing(id) => Some(id),
            SequencerState::Idle => None,
        };
        Drained {
            executing,
            pending: self.pending.drain(..).collect(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    /// Returns the executing request id, if any.
    #[must_use]
    pub fn executing(&self) -> Option<&RequestId> {
        match &self.state {
            SequencerState::Executing(id) => Some(id),
            SequencerState::Idle => None,
        }
    }

    /// Returns `true` when nothing is executing or queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == SequencerState::Idle
    }

    /// Returns the number of queued requests.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    fn contains(&self, request_id: &RequestId) -> bool {
        self.executing() == Some(request_id)
            || self.pending.iter().any(|p| &p.request_id == request_id)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RequestId {
        let Ok(id) = RequestId::new(s) else {
            panic!("valid request id");
        };
        id
    }

    fn forwarded(submission: Result<Submission, GatewayError>) -> PendingExecute {
        let Ok(Submission::Forward(request)) = submission else {
            panic!("expected request to be forwarded");
        };
        request
    }

    #[test]
    fn idle_submit_forwards_immediately() {
        let mut seq = ExecutionSequencer::new(16);
        let request = forwarded(seq.submit(rid("req-1"), "1+1".to_string()));
        assert_eq!(request.code, "1+1");
        assert_eq!(seq.state(), &SequencerState::Executing(rid("req-1")));
    }

    #[test]
    fn submit_while_executing_queues() {
        let mut seq = ExecutionSequencer::new(16);
        let _ = forwarded(seq.submit(rid("req-1"), "1+1".to_string()));
        let queued = seq.submit(rid("req-2"), "2+2".to_string());
        assert!(matches!(queued, Ok(Submission::Queued { position: 1 })));
        assert_eq!(seq.queued(), 1);
        assert_eq!(seq.executing(), Some(&rid("req-1")));
    }

    #[test]
    fn completion_forwards_next_in_fifo_order() {
        let mut seq = ExecutionSequencer::new(16);
        let _ = forwarded(seq.submit(rid("req-1"), "1+1".to_string()));
        let _ = seq.submit(rid("req-2"), "2+2".to_string());
        let _ = seq.submit(rid("req-3"), "3+3".to_string());

        let Completion::Next(next) = seq.complete(&rid("req-1")) else {
            panic!("expected req-2 to be forwarded");
        };
        assert_eq!(next.request_id, rid("req-2"));
        assert_eq!(seq.state(), &SequencerState::Executing(rid("req-2")));

        let Completion::Next(next) = seq.complete(&rid("req-2")) else {
            panic!("expected req-3 to be forwarded");
        };
        assert_eq!(next.request_id, rid("req-3"));
        assert_eq!(seq.complete(&rid("req-3")), Completion::Idle);
        assert!(seq.is_idle());
    }

    #[test]
    fn mismatched_completion_is_stale() {
        let mut seq = ExecutionSequencer::new(16);
        let _ = forwarded(seq.submit(rid("req-1"), "1+1".to_string()));
        let _ = seq.submit(rid("req-2"), "2+2".to_string());

        assert_eq!(seq.complete(&rid("req-2")), Completion::Stale);
        assert_eq!(seq.complete(&rid("other")), Completion::Stale);
        assert_eq!(seq.state(), &SequencerState::Executing(rid("req-1")));
        assert_eq!(seq.queued(), 1);
    }

    #[test]
    fn completion_while_idle_is_stale() {
        let mut seq = ExecutionSequencer::new(16);
        assert_eq!(seq.complete(&rid("req-1")), Completion::Stale);
        assert!(seq.is_idle());
    }

    #[test]
    fn duplicate_request_id_rejected() {
        let mut seq = ExecutionSequencer::new(16);
        let _ = forwarded(seq.submit(rid("req-1"), "1".to_string()));
        assert!(seq.submit(rid("req-1"), "1".to_string()).is_err());
        let _ = seq.submit(rid("req-2"), "2".to_string());
        assert!(seq.submit(rid("req-2"), "2".to_string()).is_err());
    }

    #[test]
    fn full_queue_rejects_submission() {
        let mut seq = ExecutionSequencer::new(1);
        let _ = forwarded(seq.submit(rid("a"), "a".to_string()));
        assert!(seq.submit(rid("b"), "b".to_string()).is_ok());
        assert!(seq.submit(rid("c"), "c".to_string()).is_err());
    }

    #[test]
    fn reset_drains_and_discards_old_completions() {
        let mut seq = ExecutionSequencer::new(16);
        let _ = forwarded(seq.submit(rid("req-7"), "boom".to_string()));
        let _ = seq.submit(rid("req-8"), "after".to_string());

        let drained = seq.reset();
        assert_eq!(drained.executing, Some(rid("req-7")));
        assert_eq!(drained.pending.len(), 1);
        assert!(seq.is_idle());

        assert_eq!(seq.complete(&rid("req-7")), Completion::Stale);
        assert!(seq.is_idle());
    }

    #[test]
    fn forwarding_order_matches_submission_order() {
        let mut seq = ExecutionSequencer::new(64);
        let ids: Vec<RequestId> = (0..20).map(|i| rid(&format!("r{i}"))).collect();
        let mut sent = Vec::new();
        let mut outstanding = 0usize;

        for id in &ids {
            if let Ok(Submission::Forward(p)) = seq.submit(id.clone(), String::new()) {
                sent.push(p.request_id);
                outstanding += 1;
            }
            assert!(outstanding <= 1);
        }
        while let Some(current) = seq.executing().cloned() {
            outstanding -= 1;
            if let Completion::Next(p) = seq.complete(&current) {
                sent.push(p.request_id);
                outstanding += 1;
            }
            assert!(outstanding <= 1);
        }
        assert_eq!(sent, ids);
    }
}
