use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Released,
    TimedOut,
}

/// Session side of the one-shot start handshake: announce readiness once,
/// then wait a bounded time for the coordinator to release the start.
pub struct StartGate {
    ready: Sender<String>,
    go: Receiver<()>,
    timeout: Duration,
}

impl StartGate {
    /// Consumes the gate, so readiness can only be signalled once per session.
    pub fn signal_and_wait(self, session_id: &str) -> GateOutcome {
        if self.ready.send(session_id.to_string()).is_err() {
            debug!("{session_id}: start coordinator is gone, starting immediately");
            return GateOutcome::Released;
        }

        match self.go.recv_timeout(self.timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => GateOutcome::Released,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{session_id}: no synchronized start within {:?}, starting anyway",
                    self.timeout
                );
                GateOutcome::TimedOut
            }
        }
    }

    /// Reports in without waiting, for a session that failed to set up.
    pub fn abandon(self, session_id: &str) {
        let _ = self.ready.send(session_id.to_string());
    }
}

/// Runner side of the start handshake for a group of sessions.
pub struct StartCoordinator {
    ready: Receiver<String>,
    go: Vec<Sender<()>>,
}

impl StartCoordinator {
    pub fn new(sessions: usize, timeout: Duration) -> (Self, Vec<StartGate>) {
        let (ready_tx, ready_rx) = flume::bounded(sessions.max(1));

        let mut go = Vec::with_capacity(sessions);
        let gates = (0..sessions)
            .map(|_| {
                let (go_tx, go_rx) = flume::bounded(1);
                go.push(go_tx);
                StartGate {
                    ready: ready_tx.clone(),
                    go: go_rx,
                    timeout,
                }
            })
            .collect();

        (
            Self {
                ready: ready_rx,
                go,
            },
            gates,
        )
    }

    /// Waits until every session reported ready or `timeout` passes.
    /// Returns the ids that reported in.
    pub fn wait_ready(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut ready = Vec::with_capacity(self.go.len());

        while ready.len() < self.go.len() {
            match self.ready.recv_deadline(deadline) {
                Ok(id) => {
                    debug!("{id} is ready");
                    ready.push(id);
                }
                Err(_) => break,
            }
        }

        ready
    }

    pub fn release(self) {
        for go in &self.go {
            let _ = go.try_send(());
        }
    }
}

/// Cooperative stop request checked at the top of every exchange iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn releases_all_sessions_together() {
        let (coordinator, gates) = StartCoordinator::new(3, Duration::from_secs(5));

        let handles: Vec<_> = gates
            .into_iter()
            .enumerate()
            .map(|(i, gate)| thread::spawn(move || gate.signal_and_wait(&format!("s{i}"))))
            .collect();

        let mut ready = coordinator.wait_ready(Duration::from_secs(5));
        ready.sort();
        assert_eq!(ready, vec!["s0", "s1", "s2"]);
        coordinator.release();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), GateOutcome::Released);
        }
    }

    #[test]
    fn times_out_without_release() {
        let (coordinator, mut gates) = StartCoordinator::new(1, Duration::from_millis(20));
        let gate = gates.remove(0);

        assert_eq!(gate.signal_and_wait("lonely"), GateOutcome::TimedOut);
        assert_eq!(coordinator.wait_ready(Duration::ZERO), vec!["lonely"]);
    }

    #[test]
    fn dropped_coordinator_does_not_block() {
        let (coordinator, mut gates) = StartCoordinator::new(1, Duration::from_secs(30));
        drop(coordinator);

        assert_eq!(gates.remove(0).signal_and_wait("s"), GateOutcome::Released);
    }

    #[test]
    fn cancellation_is_shared() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }
}
