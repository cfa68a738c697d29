//! In-memory transport emulating the kernel/device boundary.
//!
//! This is the test stand-in for real hardware: contexts and signals are
//! plain bookkeeping, and submissions either complete immediately or are
//! parked until the harness drives them, so tests can observe exactly when a
//! ring slot becomes reusable or a fence retires.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::DeviceError;
use crate::transport::{ContextHandle, SignalId, SignalRequest, Submission, Transport};

/// How the emulated device retires submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every commit fires its queued signals before returning.
    Immediate,
    /// Commits are parked; [`EmuTransport::complete_next`] retires them in
    /// submission order.
    Manual,
}

#[derive(Debug, Default)]
struct SignalSlot {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl SignalSlot {
    fn set(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        *fired = true;
        self.cond.notify_all();
    }

    fn wait(&self, id: SignalId, timeout: Option<Duration>) -> Result<(), DeviceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        while !*fired {
            match deadline {
                None => {
                    fired = self
                        .cond
                        .wait(fired)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero()) else {
                        return Err(DeviceError::Timeout {
                            signal: id,
                            waited_ms: timeout.unwrap_or_default().as_millis() as u64,
                        });
                    };
                    let (guard, _result) = self
                        .cond
                        .wait_timeout(fired, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    fired = guard;
                }
            }
        }
        // Auto-reset: a successful wait consumes the fired state.
        *fired = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EmuState {
    signals: HashMap<SignalId, Arc<SignalSlot>>,
    contexts: HashMap<ContextHandle, ()>,
    /// All commits in submission order, completed or not.
    submissions: Vec<Submission>,
    /// Signal queues of parked (uncompleted) submissions, oldest first.
    parked: VecDeque<Vec<SignalRequest>>,
}

/// Emulated [`Transport`].
pub struct EmuTransport {
    mode: CompletionMode,
    state: Mutex<EmuState>,
    completed_fence: AtomicU32,
    next_signal: AtomicU32,
    next_context: AtomicU64,
    fail_attach: AtomicBool,
    fail_commit: AtomicBool,
    /// Countdown to an injected signal-creation failure (0 = disarmed).
    signal_new_failures_after: AtomicU32,
}

impl EmuTransport {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            state: Mutex::new(EmuState::default()),
            completed_fence: AtomicU32::new(0),
            next_signal: AtomicU32::new(1),
            next_context: AtomicU64::new(1),
            fail_attach: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            signal_new_failures_after: AtomicU32::new(0),
        }
    }

    pub fn immediate() -> Self {
        Self::new(CompletionMode::Immediate)
    }

    pub fn manual() -> Self {
        Self::new(CompletionMode::Manual)
    }

    fn state(&self) -> MutexGuard<'_, EmuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, requests: &[SignalRequest], slots: &HashMap<SignalId, Arc<SignalSlot>>) {
        for request in requests {
            match request {
                SignalRequest::User { signal, .. } => {
                    if let Some(slot) = slots.get(signal) {
                        slot.set();
                    }
                }
                SignalRequest::FenceReached { fence, .. } => {
                    self.completed_fence.fetch_max(*fence, Ordering::SeqCst);
                }
            }
        }
    }

    /// Retire the oldest parked submission, firing its queued signals.
    /// Returns false when nothing is parked.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state();
        let Some(requests) = state.parked.pop_front() else {
            return false;
        };
        let slots = state.signals.clone();
        drop(state);
        trace!("retiring parked submission");
        self.retire(&requests, &slots);
        true
    }

    /// Retire every parked submission in order.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Device's completed-fence watermark.
    pub fn completed_fence(&self) -> u32 {
        self.completed_fence.load(Ordering::SeqCst)
    }

    /// Every commit in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn parked_count(&self) -> usize {
        self.state().parked.len()
    }

    pub fn live_signal_count(&self) -> usize {
        self.state().signals.len()
    }

    pub fn attached_context_count(&self) -> usize {
        self.state().contexts.len()
    }

    /// Make the next attach fail (construction-atomicity tests).
    pub fn fail_next_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Make the next commit fail.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Fail signal creation after `n` more successful creations.
    pub fn fail_signal_new_after(&self, n: u32) {
        self.signal_new_failures_after
            .store(n.saturating_add(1), Ordering::SeqCst);
    }
}

impl Transport for EmuTransport {
    fn attach(&self) -> Result<ContextHandle, DeviceError> {
        if self.fail_attach.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Attach("injected attach failure"));
        }
        let handle = ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed));
        self.state().contexts.insert(handle, ());
        debug!(?handle, "attached context");
        Ok(handle)
    }

    fn detach(&self, context: ContextHandle) -> Result<(), DeviceError> {
        if self.state().contexts.remove(&context).is_none() {
            return Err(DeviceError::Detach("unknown context"));
        }
        debug!(?context, "detached context");
        Ok(())
    }

    fn signal_new(&self) -> Result<SignalId, DeviceError> {
        let armed = self.signal_new_failures_after.load(Ordering::SeqCst);
        if armed > 0 {
            if armed == 1 {
                return Err(DeviceError::SignalCreate("injected signal failure"));
            }
            self.signal_new_failures_after
                .store(armed - 1, Ordering::SeqCst);
        }
        let id = SignalId(self.next_signal.fetch_add(1, Ordering::Relaxed));
        self.state().signals.insert(id, Arc::new(SignalSlot::default()));
        Ok(id)
    }

    fn signal_destroy(&self, signal: SignalId) -> Result<(), DeviceError> {
        self.state()
            .signals
            .remove(&signal)
            .map(|_| ())
            .ok_or(DeviceError::UnknownSignal(signal))
    }

    fn signal_set(&self, signal: SignalId) -> Result<(), DeviceError> {
        let slot = self
            .state()
            .signals
            .get(&signal)
            .cloned()
            .ok_or(DeviceError::UnknownSignal(signal))?;
        slot.set();
        Ok(())
    }

    fn signal_wait(&self, signal: SignalId, timeout: Option<Duration>) -> Result<(), DeviceError> {
        let slot = self
            .state()
            .signals
            .get(&signal)
            .cloned()
            .ok_or(DeviceError::UnknownSignal(signal))?;
        slot.wait(signal, timeout)
    }

    fn commit(&self, submission: Submission) -> Result<(), DeviceError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Commit("injected commit failure"));
        }
        let mut state = self.state();
        if !state.contexts.contains_key(&submission.context) {
            return Err(DeviceError::Commit("unknown context"));
        }
        debug!(
            fence = ?submission.fence,
            signals = submission.signals.len(),
            has_region = submission.region.is_some(),
            "commit"
        );
        state.submissions.push(submission.clone());
        match self.mode {
            CompletionMode::Immediate => {
                let slots = state.signals.clone();
                drop(state);
                self.retire(&submission.signals, &slots);
            }
            CompletionMode::Manual => {
                state.parked.push_back(submission.signals);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SignalStage;
    use pretty_assertions::assert_eq;

    #[test]
    fn signals_auto_reset_after_wait() {
        let emu = EmuTransport::immediate();
        let sig = emu.signal_new().unwrap();
        emu.signal_set(sig).unwrap();
        emu.signal_wait(sig, None).unwrap();
        // Consumed: a bounded re-wait must time out.
        let err = emu
            .signal_wait(sig, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { signal, .. } if signal == sig));
    }

    #[test]
    fn manual_mode_parks_until_completed() {
        let emu = EmuTransport::manual();
        let ctx = emu.attach().unwrap();
        let sig = emu.signal_new().unwrap();
        emu.commit(Submission {
            context: ctx,
            region: None,
            signals: vec![
                SignalRequest::User {
                    signal: sig,
                    stage: SignalStage::Command,
                },
                SignalRequest::FenceReached {
                    fence: 7,
                    stage: SignalStage::Pixel,
                },
            ],
            fence: Some(7),
        })
        .unwrap();

        assert_eq!(emu.parked_count(), 1);
        assert_eq!(emu.completed_fence(), 0);
        let err = emu
            .signal_wait(sig, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));

        assert!(emu.complete_next());
        assert_eq!(emu.completed_fence(), 7);
        emu.signal_wait(sig, Some(Duration::from_millis(5))).unwrap();
        assert!(!emu.complete_next());
    }

    #[test]
    fn commit_rejects_unknown_context() {
        let emu = EmuTransport::immediate();
        let err = emu
            .commit(Submission {
                context: ContextHandle(99),
                region: None,
                signals: Vec::new(),
                fence: None,
            })
            .unwrap_err();
        assert_eq!(err, DeviceError::Commit("unknown context"));
    }

    #[test]
    fn injected_attach_failure_is_one_shot() {
        let emu = EmuTransport::immediate();
        emu.fail_next_attach();
        assert!(emu.attach().is_err());
        assert!(emu.attach().is_ok());
    }
}
