//! Fair-share concurrency gate.
//!
//! A fixed number of execution slots is shared by every agent. Callers that
//! find no free slot park in a FIFO wait queue. When a slot frees up it goes
//! to the first waiter whose agent is still below its fair share
//! (`ceil(max / contending agents)`); when every waiting agent is at or over
//! its share the head of the queue wins so nobody starves.
//!
//! Parked callers are woken through a oneshot channel, never by polling.
//! Dropping a parked [`ConcurrencyGate::acquire`] future is safe: the waiter
//! leaves the queue, and a slot that was handed over but never observed goes
//! back to the pool.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};
use warden_core::GateConfig;

use crate::error::ControlError;

/// Observability snapshot of the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub active: usize,
    pub queued: usize,
    pub max: usize,
    pub active_by_agent: BTreeMap<String, usize>,
    pub queued_by_agent: BTreeMap<String, usize>,
}

struct Waiter {
    ticket: u64,
    agent_id: String,
    grant: oneshot::Sender<()>,
}

struct GateState {
    max: usize,
    active: usize,
    active_by_agent: HashMap<String, usize>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl GateState {
    fn active_of(&self, agent_id: &str) -> usize {
        self.active_by_agent.get(agent_id).copied().unwrap_or(0)
    }

    fn take_slot(&mut self, agent_id: &str) {
        self.active += 1;
        *self.active_by_agent.entry(agent_id.to_string()).or_insert(0) += 1;
    }

    /// Returns `false` when the agent holds nothing.
    fn return_slot(&mut self, agent_id: &str) -> bool {
        let Some(count) = self.active_by_agent.get_mut(agent_id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.active_by_agent.remove(agent_id);
        }
        self.active = self.active.saturating_sub(1);
        true
    }

    fn fair_share(&self) -> usize {
        let contenders: HashSet<&str> = self
            .active_by_agent
            .keys()
            .map(String::as_str)
            .chain(self.queue.iter().map(|w| w.agent_id.as_str()))
            .collect();
        self.max.div_ceil(contenders.len().max(1))
    }

    /// Index of the waiter that should get the next free slot.
    fn next_waiter(&self) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        let share = self.fair_share();
        let preferred = self
            .queue
            .iter()
            .position(|w| self.active_of(&w.agent_id) < share);
        if preferred.is_none() {
            debug!(fair_share = share, "all waiting agents at fair share, granting queue head");
        }
        Some(preferred.unwrap_or(0))
    }

    /// Hand free slots to waiters until slots or waiters run out.
    fn dispatch(&mut self) {
        while self.active < self.max {
            let Some(idx) = self.next_waiter() else {
                return;
            };
            let Some(waiter) = self.queue.remove(idx) else {
                return;
            };
            self.take_slot(&waiter.agent_id);
            if waiter.grant.send(()).is_err() {
                // Receiver vanished without cleaning up; give the slot back.
                self.return_slot(&waiter.agent_id);
                continue;
            }
            debug!(
                agent_id = %waiter.agent_id,
                active = self.active,
                queued = self.queue.len(),
                "slot granted to waiter"
            );
        }
    }
}

/// Shared slot pool with FIFO + fair-share queuing.
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    pub fn new(max_global_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                max: max_global_concurrent.max(1),
                active: 0,
                active_by_agent: HashMap::new(),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.max_global_concurrent)
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the slot limit.
    ///
    /// Raising it grants queued waiters straight away. Lowering it never
    /// revokes held slots; the surplus drains through normal releases.
    pub fn configure(&self, max_global_concurrent: usize) {
        let mut state = self.lock();
        state.max = max_global_concurrent.max(1);
        info!(max = state.max, "concurrency gate reconfigured");
        state.dispatch();
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, agent_id: &str) -> bool {
        let mut state = self.lock();
        if state.active < state.max {
            state.take_slot(agent_id);
            true
        } else {
            false
        }
    }

    /// Wait until `agent_id` holds a slot.
    ///
    /// The caller must eventually call [`release`](Self::release) for every
    /// completed acquire.
    pub async fn acquire(&self, agent_id: &str) {
        let (ticket, rx) = {
            let mut state = self.lock();
            if state.active < state.max {
                state.take_slot(agent_id);
                debug!(agent_id, active = state.active, "slot granted immediately");
                return;
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                ticket,
                agent_id: agent_id.to_string(),
                grant: tx,
            });
            debug!(agent_id, queued = state.queue.len(), "no free slot, waiting");
            (ticket, rx)
        };

        let mut pending = PendingAcquire {
            gate: self,
            ticket,
            agent_id,
            rx,
            granted: false,
        };
        pending.wait().await;
    }

    /// [`acquire`](Self::acquire), giving up after `timeout`.
    pub async fn acquire_timeout(&self, agent_id: &str, timeout: Duration) -> Result<(), ControlError> {
        tokio::time::timeout(timeout, self.acquire(agent_id))
            .await
            .map_err(|_| ControlError::AcquireTimeout {
                agent_id: agent_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// [`acquire`](Self::acquire), giving up as soon as `cancel` completes.
    ///
    /// A slot that is available at the same moment the cancellation fires
    /// is taken rather than dropped.
    pub async fn acquire_until<F>(&self, agent_id: &str, cancel: F) -> Result<(), ControlError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = self.acquire(agent_id) => Ok(()),
            _ = cancel => Err(ControlError::AcquireCancelled {
                agent_id: agent_id.to_string(),
            }),
        }
    }

    /// Return one of `agent_id`'s slots and wake the next eligible waiter.
    ///
    /// Releasing a slot the agent does not hold is ignored.
    pub fn release(&self, agent_id: &str) {
        let mut state = self.lock();
        if !state.return_slot(agent_id) {
            debug!(agent_id, "release without a held slot ignored");
            return;
        }
        debug!(agent_id, active = state.active, "slot released");
        state.dispatch();
    }

    pub fn stats(&self) -> GateStats {
        let state = self.lock();
        let mut queued_by_agent = BTreeMap::new();
        for w in &state.queue {
            *queued_by_agent.entry(w.agent_id.clone()).or_insert(0) += 1;
        }
        GateStats {
            active: state.active,
            queued: state.queue.len(),
            max: state.max,
            active_by_agent: state
                .active_by_agent
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            queued_by_agent,
        }
    }

    /// Drop a waiter whose acquire future went away.
    fn abandon(&self, ticket: u64, agent_id: &str) {
        let mut state = self.lock();
        if let Some(idx) = state.queue.iter().position(|w| w.ticket == ticket) {
            state.queue.remove(idx);
            debug!(agent_id, "waiter abandoned before grant");
            return;
        }
        // Already granted but never observed.
        if state.return_slot(agent_id) {
            debug!(agent_id, "abandoned grant returned to pool");
            state.dispatch();
        }
    }
}

/// A queued acquire. Cleans up after itself if dropped before completion.
struct PendingAcquire<'a> {
    gate: &'a ConcurrencyGate,
    ticket: u64,
    agent_id: &'a str,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl PendingAcquire<'_> {
    async fn wait(&mut self) {
        // The sender lives in the queue until the gate sends on it or this
        // waiter's own Drop removes it, so the only outcome here is a grant.
        let _ = (&mut self.rx).await;
        self.granted = true;
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.granted {
            self.gate.abandon(self.ticket, self.agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn wait_for_queued(gate: &ConcurrencyGate, n: usize) {
        for _ in 0..1_000 {
            if gate.stats().queued == n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {n}, stats: {:?}", gate.stats());
    }

    fn spawn_acquire(gate: &Arc<ConcurrencyGate>, agent: &'static str) -> tokio::task::JoinHandle<()> {
        let gate = gate.clone();
        tokio::spawn(async move { gate.acquire(agent).await })
    }

    fn assert_consistent(gate: &ConcurrencyGate) {
        let s = gate.stats();
        assert_eq!(s.active_by_agent.values().sum::<usize>(), s.active);
        assert!(s.active <= s.max || s.queued == 0);
        assert!(s.active_by_agent.values().all(|&v| v > 0));
    }

    #[tokio::test]
    async fn grants_immediately_below_limit() {
        let gate = ConcurrencyGate::new(2);
        gate.acquire("a").await;
        gate.acquire("b").await;
        let s = gate.stats();
        assert_eq!(s.active, 2);
        assert_eq!(s.queued, 0);
        assert_eq!(s.active_by_agent.get("a"), Some(&1));
        assert_consistent(&gate);
    }

    #[tokio::test]
    async fn under_share_agent_jumps_ahead_of_greedy_agent() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        gate.acquire("A").await;
        gate.acquire("A").await;

        let b = spawn_acquire(&gate, "B");
        wait_for_queued(&gate, 1).await;
        let a2 = spawn_acquire(&gate, "A");
        wait_for_queued(&gate, 2).await;

        gate.release("A");
        let s = gate.stats();
        assert_eq!(s.active_by_agent, BTreeMap::from([("A".into(), 1), ("B".into(), 1)]));
        assert_eq!(s.queued, 1);
        b.await.unwrap();
        assert!(!a2.is_finished());

        gate.release("A");
        a2.await.unwrap();
        let s = gate.stats();
        assert_eq!(s.active, 2);
        assert_eq!(s.queued, 0);
        assert_eq!(s.active_by_agent, BTreeMap::from([("A".into(), 1), ("B".into(), 1)]));
        assert_consistent(&gate);
    }

    #[tokio::test]
    async fn queue_head_wins_when_everyone_is_at_share() {
        let gate = Arc::new(ConcurrencyGate::new(4));
        for agent in ["A", "A", "B", "B"] {
            gate.acquire(agent).await;
        }
        let b1 = spawn_acquire(&gate, "B");
        wait_for_queued(&gate, 1).await;
        let b2 = spawn_acquire(&gate, "B");
        wait_for_queued(&gate, 2).await;

        // A drops to 1; share is ceil(4/2)=2 and B already holds 2.
        gate.release("A");
        b1.await.unwrap();
        let s = gate.stats();
        assert_eq!(s.active_by_agent, BTreeMap::from([("A".into(), 1), ("B".into(), 3)]));
        assert_eq!(s.queued, 1);
        assert!(!b2.is_finished());
        b2.abort();
    }

    #[tokio::test]
    async fn release_removes_zero_entries_and_floors_at_zero() {
        let gate = ConcurrencyGate::new(2);
        gate.acquire("a").await;
        gate.release("a");
        gate.release("a");
        gate.release("ghost");
        let s = gate.stats();
        assert_eq!(s.active, 0);
        assert!(s.active_by_agent.is_empty());
        assert_consistent(&gate);
    }

    #[tokio::test]
    async fn try_acquire_never_parks() {
        let gate = ConcurrencyGate::new(1);
        assert!(gate.try_acquire("a"));
        assert!(!gate.try_acquire("b"));
        assert_eq!(gate.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_leaves_the_queue() {
        let gate = ConcurrencyGate::new(1);
        gate.acquire("holder").await;

        let err = gate
            .acquire_timeout("late", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AcquireTimeout { timeout_ms: 50, .. }));
        assert_eq!(gate.stats().queued, 0);

        gate.release("holder");
        let s = gate.stats();
        assert_eq!(s.active, 0);
        assert!(s.active_by_agent.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_granted() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        gate.acquire("holder").await;

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let g = gate.clone();
        let waiter = tokio::spawn(async move {
            g.acquire_until("w", async {
                let _ = cancel_rx.await;
            })
            .await
        });
        wait_for_queued(&gate, 1).await;
        cancel_tx.send(()).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ControlError::AcquireCancelled { .. })));
        gate.release("holder");
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test]
    async fn grant_to_aborted_task_returns_to_pool() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        gate.acquire("holder").await;
        let waiter = spawn_acquire(&gate, "w");
        wait_for_queued(&gate, 1).await;

        // Grant is sent, then the task dies before it ever observes it.
        gate.release("holder");
        waiter.abort();
        let _ = waiter.await;

        let s = gate.stats();
        assert_eq!(s.active, 0);
        assert!(s.active_by_agent.is_empty());
        assert_eq!(s.queued, 0);
    }

    #[tokio::test]
    async fn raising_limit_drains_waiters() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        gate.acquire("a").await;
        let b = spawn_acquire(&gate, "b");
        let c = spawn_acquire(&gate, "c");
        wait_for_queued(&gate, 2).await;

        gate.configure(3);
        b.await.unwrap();
        c.await.unwrap();
        let s = gate.stats();
        assert_eq!(s.active, 3);
        assert_eq!(s.max, 3);
        assert_consistent(&gate);
    }

    #[tokio::test]
    async fn stats_report_queued_by_agent() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        gate.acquire("a").await;
        let w1 = spawn_acquire(&gate, "b");
        let w2 = spawn_acquire(&gate, "b");
        wait_for_queued(&gate, 2).await;
        assert_eq!(gate.stats().queued_by_agent.get("b"), Some(&2));
        w1.abort();
        w2.abort();
    }
}
