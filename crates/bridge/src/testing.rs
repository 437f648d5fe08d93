//! In-memory transfer backend
//!
//! [`MockBackend`] plays the device side of the bulk pipe: reads stay
//! pending until the test calls [`MockBackend::peer_send`], writes are
//! recorded and (by default) acknowledged immediately. Used by the unit and
//! integration tests and handy for driving a port without hardware.

use crate::sync::{lock, wait_timeout};
use crate::transfer::{
    Direction, SubmitError, SubmitFailure, TransferBackend, TransferError, TransferId,
    TransferOutcome, TransferRequest,
};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    pending_in: VecDeque<TransferRequest>,
    pending_out: VecDeque<TransferRequest>,
    peak_pending_in: usize,
    transmitted: Vec<u8>,
    writes: Vec<Vec<u8>>,
    zero_packets: usize,
    fail_in: usize,
    fail_out: usize,
    shut_down: bool,
}

pub struct MockBackend {
    state: Mutex<MockState>,
    changed: Condvar,
    auto_complete_writes: bool,
}

impl MockBackend {
    /// Backend that acknowledges every write as soon as it is submitted
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            auto_complete_writes: true,
        })
    }

    /// Backend that keeps writes in flight until completed explicitly
    pub fn with_manual_writes() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            auto_complete_writes: false,
        })
    }

    /// Refuse the next `count` submissions in `direction` with `NoResources`
    pub fn fail_next_submits(&self, direction: Direction, count: usize) {
        let mut state = lock(&self.state);
        match direction {
            Direction::In => state.fail_in = count,
            Direction::Out => state.fail_out = count,
        }
    }

    pub fn pending_in(&self) -> usize {
        lock(&self.state).pending_in.len()
    }

    pub fn pending_out(&self) -> usize {
        lock(&self.state).pending_out.len()
    }

    /// Most reads ever pending at the same time
    pub fn peak_pending_in(&self) -> usize {
        lock(&self.state).peak_pending_in
    }

    /// Wait until a read is pending
    pub fn wait_for_pending_in(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);

        while state.pending_in.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = wait_timeout(&self.changed, state, remaining).0;
        }
        true
    }

    /// Feed `bytes` into the pending reads, one read per packet
    ///
    /// Returns how many bytes found a read to land in; the rest is lost.
    pub fn peer_send(&self, bytes: &[u8]) -> usize {
        let mut completed = Vec::new();
        let mut sent = 0;
        {
            let mut state = lock(&self.state);
            while sent < bytes.len() {
                let Some(mut request) = state.pending_in.pop_front() else {
                    break;
                };
                let chunk = &bytes[sent..];
                let n = chunk.len().min(request.buffer().len());
                request.buffer_mut().as_mut_slice()[..n].copy_from_slice(&chunk[..n]);
                sent += n;
                completed.push((request, n));
            }
        }

        for (request, n) in completed {
            request.complete(TransferOutcome::Completed(n));
        }
        sent
    }

    /// Like [`peer_send`](Self::peer_send), waiting for the pump to
    /// resubmit between packets
    pub fn peer_send_all(&self, bytes: &[u8], timeout: Duration) -> usize {
        let mut sent = 0;
        while sent < bytes.len() {
            if !self.wait_for_pending_in(timeout) {
                break;
            }
            let n = self.peer_send(&bytes[sent..]);
            if n == 0 {
                break;
            }
            sent += n;
        }
        sent
    }

    /// Complete the oldest pending read with `outcome`
    pub fn complete_in(&self, outcome: TransferOutcome) -> bool {
        let request = lock(&self.state).pending_in.pop_front();
        match request {
            Some(request) => {
                request.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Acknowledge every write in flight
    pub fn complete_writes(&self) -> usize {
        let requests: Vec<_> = lock(&self.state).pending_out.drain(..).collect();
        let count = requests.len();
        for request in requests {
            let n = request.buffer().len();
            request.complete(TransferOutcome::Completed(n));
        }
        count
    }

    /// Fail every write in flight with `error`
    pub fn fail_writes(&self, error: TransferError) -> usize {
        let requests: Vec<_> = lock(&self.state).pending_out.drain(..).collect();
        let count = requests.len();
        for request in requests {
            request.complete(TransferOutcome::Error(error.clone()));
        }
        count
    }

    /// Every byte written, in submission order
    pub fn transmitted(&self) -> Vec<u8> {
        lock(&self.state).transmitted.clone()
    }

    /// Write payloads, one entry per transfer
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Writes that asked for a terminating zero-length packet
    pub fn zero_packets(&self) -> usize {
        lock(&self.state).zero_packets
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}

impl TransferBackend for MockBackend {
    fn submit(&self, request: TransferRequest) -> Result<TransferId, SubmitFailure> {
        let id = request.id();
        let mut state = lock(&self.state);

        if state.shut_down {
            return Err(SubmitFailure::new(SubmitError::Closed, request));
        }

        let fail = match request.direction() {
            Direction::In => &mut state.fail_in,
            Direction::Out => &mut state.fail_out,
        };
        if *fail > 0 {
            *fail -= 1;
            return Err(SubmitFailure::new(SubmitError::NoResources, request));
        }

        match request.direction() {
            Direction::In => {
                state.pending_in.push_back(request);
                state.peak_pending_in = state.peak_pending_in.max(state.pending_in.len());
            }
            Direction::Out => {
                let payload = request.buffer().as_slice().to_vec();
                state.transmitted.extend_from_slice(&payload);
                state.writes.push(payload);
                if request.zero_packet() {
                    state.zero_packets += 1;
                }

                if self.auto_complete_writes {
                    drop(state);
                    let n = request.buffer().len();
                    request.complete(TransferOutcome::Completed(n));
                    self.changed.notify_all();
                    return Ok(id);
                }
                state.pending_out.push_back(request);
            }
        }

        drop(state);
        self.changed.notify_all();
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        let request = {
            let mut state = lock(&self.state);
            let position = state.pending_in.iter().position(|r| r.id() == id);
            match position {
                Some(i) => state.pending_in.remove(i),
                None => {
                    let position = state.pending_out.iter().position(|r| r.id() == id);
                    position.and_then(|i| state.pending_out.remove(i))
                }
            }
        };

        if let Some(request) = request {
            request.complete(TransferOutcome::Cancelled);
            self.changed.notify_all();
        }
    }

    fn shutdown(&self) {
        let requests: Vec<_> = {
            let mut state = lock(&self.state);
            state.shut_down = true;
            let mut requests: Vec<_> = state.pending_in.drain(..).collect();
            requests.extend(state.pending_out.drain(..));
            requests
        };

        for request in requests {
            request.complete(TransferOutcome::Cancelled);
        }
        self.changed.notify_all();
    }
}
