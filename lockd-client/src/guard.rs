//! The client-side guard: one request's state machine (§4.5).
//!
//! IDLE → LOCKING → LOCKED → UNLOCKING → IDLE, with a FAILED branch
//! reachable from any state. `SIMPLE` mode auto-unlocks once `obtained`
//! returns; `EXTENDED` mode leaves that to the caller.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lockd_core::error::FailureReason;
use lockd_core::messages::{ClientMessage, LockKind, LockRequest, UnlockRequest};
use thiserror::Error;
use tracing::debug;

use crate::transport::{ClientTransport, Dispatcher, TagAllocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Simple,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Locking,
    Locked,
    Unlocking,
    Failed,
}

/// Reason codes reported on lock failure (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailReason {
    #[error("no failure")]
    None,
    #[error("local obtention timer fired first")]
    LocalTimeout,
    #[error("remote side reported a timeout")]
    RemoteTimeout,
    #[error("deadlock detected")]
    Deadlock,
    #[error("invalid request parameters")]
    Invalid,
    #[error("transmission error")]
    TransmissionError,
}

impl From<FailureReason> for FailReason {
    fn from(r: FailureReason) -> Self {
        match r {
            FailureReason::Timedout => FailReason::RemoteTimeout,
            FailureReason::Invalid | FailureReason::Duplicate | FailureReason::Failed => {
                FailReason::Invalid
            }
            FailureReason::TransmissionError => FailReason::TransmissionError,
        }
    }
}

pub struct LockOptions {
    pub object_name: String,
    pub pid: u32,
    pub obtention_timeout: Duration,
    pub duration: Option<Duration>,
    pub unlock_duration: Option<Duration>,
    pub kind: LockKind,
    pub mode: Mode,
}

impl LockOptions {
    pub fn new(object_name: impl Into<String>, pid: u32) -> Self {
        Self {
            object_name: object_name.into(),
            pid,
            obtention_timeout: Duration::from_secs(5),
            duration: None,
            unlock_duration: None,
            kind: LockKind::Default,
            mode: Mode::Simple,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LockOutcome {
    Locked { timeout_date: u64, unlocked_date: u64 },
    Failed(FailReason),
}

/// A hook fired with the guard's object name, returning whether the lock
/// should stay held (`true`) or be released immediately (`false`).
type Callback = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// One in-flight (or idle, reusable) lock request.
pub struct LockGuard {
    transport: Arc<dyn ClientTransport>,
    dispatcher: Arc<Dispatcher>,
    tags: Arc<TagAllocator>,
    serial: AtomicI64,
    state: std::sync::Mutex<GuardState>,
    object_name: std::sync::Mutex<Option<String>>,
    timeout_date: AtomicI64,
    locked_callback: std::sync::Mutex<Option<Callback>>,
    failed_callback: std::sync::Mutex<Option<Callback>>,
}

impl LockGuard {
    pub fn new(transport: Arc<dyn ClientTransport>, dispatcher: Arc<Dispatcher>, tags: Arc<TagAllocator>) -> Self {
        Self {
            transport,
            dispatcher,
            tags,
            serial: AtomicI64::new(-1),
            state: std::sync::Mutex::new(GuardState::Idle),
            object_name: std::sync::Mutex::new(None),
            timeout_date: AtomicI64::new(0),
            locked_callback: std::sync::Mutex::new(None),
            failed_callback: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> GuardState {
        *self.state.lock().unwrap()
    }

    /// `true` iff currently holding the lock and its timeout hasn't passed.
    pub fn is_locked(&self, now: u64) -> bool {
        self.state() == GuardState::Locked && (self.timeout_date.load(Ordering::Relaxed) as u64) > now
    }

    pub fn get_timeout_date(&self) -> u64 {
        self.timeout_date.load(Ordering::Relaxed).max(0) as u64
    }

    /// Register a hook fired after a successful LOCK. Its return value
    /// overrides `Mode::Simple`'s auto-unlock: `true` keeps the lock held.
    /// The counterpart to the teacher's `set_locked_callback`, for a
    /// long-lived process juggling several concurrent guards by callback
    /// instead of by awaiting each one.
    pub fn set_locked_callback(&self, callback: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.locked_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Register a hook fired after a failed LOCK. The return value is
    /// ignored; kept `bool`-returning only to match `set_locked_callback`.
    pub fn set_failed_callback(&self, callback: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.failed_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Drive one LOCK request to completion. Only valid from `Idle`.
    async fn run_lock(&self, opts: LockOptions) -> LockOutcome {
        {
            let mut state = self.state.lock().unwrap();
            if *state != GuardState::Idle {
                return LockOutcome::Failed(FailReason::Invalid);
            }
            *state = GuardState::Locking;
        }
        *self.object_name.lock().unwrap() = Some(opts.object_name.clone());

        let tag = self.tags.allocate();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed).max(0) as i32;
        let mut rx = self.dispatcher.register(tag);

        let timeout = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + opts.obtention_timeout.as_secs();

        let req = LockRequest {
            object_name: opts.object_name.clone(),
            tag,
            pid: opts.pid,
            serial,
            timeout,
            duration: opts.duration.map(|d| d.as_secs()),
            unlock_duration: opts.unlock_duration.map(|d| d.as_secs()),
            kind: opts.kind,
        };

        let outcome = if let Err(err) = self.transport.send_lock(req).await {
            debug!(error = %err, "send_lock failed");
            LockOutcome::Failed(FailReason::TransmissionError)
        } else {
            match tokio::time::timeout(opts.obtention_timeout, rx.recv()).await {
                Ok(Some(ClientMessage::Locked(locked))) => {
                    self.timeout_date.store(locked.timeout_date as i64, Ordering::Relaxed);
                    LockOutcome::Locked {
                        timeout_date: locked.timeout_date,
                        unlocked_date: locked.unlocked_date,
                    }
                }
                Ok(Some(ClientMessage::LockFailed(failed))) => {
                    LockOutcome::Failed(failed.error.into_domain().into())
                }
                Ok(_) | Err(_) => LockOutcome::Failed(FailReason::LocalTimeout),
            }
        };

        self.dispatcher.deregister(tag);
        *self.state.lock().unwrap() = match outcome {
            LockOutcome::Locked { .. } => GuardState::Locked,
            LockOutcome::Failed(_) => GuardState::Failed,
        };

        outcome
    }

    /// Run one LOCK request and fire whichever callback applies, deciding
    /// whether to auto-unlock from the callback's answer when one is
    /// registered, or from `opts.mode` otherwise.
    async fn run_and_notify(self: &Arc<Self>, opts: LockOptions) -> LockOutcome {
        let mode = opts.mode;
        let object_name = opts.object_name.clone();
        let outcome = self.run_lock(opts).await;
        match &outcome {
            LockOutcome::Locked { .. } => {
                let keep_locked = {
                    let cb = self.locked_callback.lock().unwrap();
                    cb.as_ref().map(|f| f(&object_name)).unwrap_or(mode == Mode::Extended)
                };
                if !keep_locked {
                    self.unlock().await;
                }
            }
            LockOutcome::Failed(_) => {
                let cb = self.failed_callback.lock().unwrap();
                if let Some(f) = cb.as_ref() {
                    f(&object_name);
                }
            }
        }
        outcome
    }

    /// Drive one LOCK request to completion and return its outcome. Only
    /// valid from `Idle`.
    pub async fn lock(self: &Arc<Self>, opts: LockOptions) -> LockOutcome {
        self.run_and_notify(opts).await
    }

    /// Fire-and-forget counterpart to `lock`, for a long-lived process that
    /// holds several concurrent guards and drives them by callback instead
    /// of by awaiting each one. The outcome reaches the caller only through
    /// `set_locked_callback`/`set_failed_callback`.
    pub fn begin_lock(self: &Arc<Self>, opts: LockOptions) {
        let guard = self.clone();
        tokio::spawn(async move {
            guard.run_and_notify(opts).await;
        });
    }

    /// Release a held lock. Valid from `Locked` (or `Locking`, which
    /// aborts the in-flight request).
    pub async fn unlock(&self) -> bool {
        let object_name = {
            let state = self.state.lock().unwrap();
            if *state != GuardState::Locked && *state != GuardState::Locking {
                return false;
            }
            self.object_name.lock().unwrap().clone()
        };
        let Some(object_name) = object_name else {
            return false;
        };
        *self.state.lock().unwrap() = GuardState::Unlocking;

        let tag = self.tags.allocate();
        let mut rx = self.dispatcher.register(tag);
        let req = UnlockRequest {
            object_name,
            tag,
            pid: 0,
            serial: self.serial.load(Ordering::Relaxed) as i32,
        };
        let ok = if self.transport.send_unlock(req).await.is_err() {
            false
        } else {
            matches!(
                tokio::time::timeout(Duration::from_secs(5), rx.recv()).await,
                Ok(Some(ClientMessage::Unlocked(_)))
            )
        };
        self.dispatcher.deregister(tag);
        *self.state.lock().unwrap() = GuardState::Idle;
        ok
    }
}

trait ReasonWireExt {
    fn into_domain(self) -> FailureReason;
}

impl ReasonWireExt for lockd_core::messages::ReasonWire {
    fn into_domain(self) -> FailureReason {
        use lockd_core::messages::ReasonWire as W;
        match self {
            W::Timedout => FailureReason::Timedout,
            W::Invalid => FailureReason::Invalid,
            W::Duplicate => FailureReason::Duplicate,
            W::Failed => FailureReason::Failed,
            W::TransmissionError => FailureReason::TransmissionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lockd_core::error::Result;
    use lockd_core::messages::ReadinessWire;
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        dispatcher: Arc<Dispatcher>,
        reply: StdMutex<Option<ClientMessage>>,
    }

    #[async_trait]
    impl ClientTransport for FakeTransport {
        async fn send_lock(&self, req: LockRequest) -> Result<()> {
            if let Some(reply) = self.reply.lock().unwrap().take() {
                self.dispatcher.deliver(req.tag, reply);
            }
            Ok(())
        }
        async fn send_unlock(&self, req: UnlockRequest) -> Result<()> {
            self.dispatcher.deliver(
                req.tag,
                ClientMessage::Unlocked(lockd_core::messages::Unlocked {
                    object_name: req.object_name,
                    tag: req.tag,
                    timed_out: false,
                    unlocked_date: 0,
                }),
            );
            Ok(())
        }
        async fn send_status_probe(&self) -> Result<ReadinessWire> {
            Ok(ReadinessWire::LockReady)
        }
    }

    fn guard_with_reply(reply: Option<ClientMessage>) -> (Arc<LockGuard>, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let transport = Arc::new(FakeTransport {
            dispatcher: dispatcher.clone(),
            reply: StdMutex::new(reply),
        });
        (
            Arc::new(LockGuard::new(transport, dispatcher.clone(), Arc::new(TagAllocator::new()))),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn simple_mode_auto_unlocks_after_obtained() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::Locked(
            lockd_core::messages::Locked {
                object_name: "o".into(),
                tag: 0,
                timeout_date: 1_000,
                unlocked_date: 1_005,
            },
        )));
        let mut opts = LockOptions::new("o", 1);
        opts.mode = Mode::Simple;
        let outcome = guard.lock(opts).await;
        assert!(matches!(outcome, LockOutcome::Locked { .. }));
        assert_eq!(guard.state(), GuardState::Idle, "SIMPLE mode must auto-unlock");
    }

    #[tokio::test]
    async fn extended_mode_stays_locked_until_explicit_unlock() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::Locked(
            lockd_core::messages::Locked {
                object_name: "o".into(),
                tag: 0,
                timeout_date: 1_000,
                unlocked_date: 1_005,
            },
        )));
        let mut opts = LockOptions::new("o", 1);
        opts.mode = Mode::Extended;
        guard.lock(opts).await;
        assert_eq!(guard.state(), GuardState::Locked);
        assert!(guard.unlock().await);
        assert_eq!(guard.state(), GuardState::Idle);
    }

    #[tokio::test]
    async fn lock_failed_reply_surfaces_the_reason() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::LockFailed(
            lockd_core::messages::LockFailed {
                object_name: "o".into(),
                tag: 0,
                key: String::new(),
                error: lockd_core::messages::ReasonWire::Duplicate,
                description: None,
            },
        )));
        let outcome = guard.lock(LockOptions::new("o", 1)).await;
        assert!(matches!(outcome, LockOutcome::Failed(FailReason::Invalid)));
    }

    #[tokio::test]
    async fn no_reply_times_out_locally() {
        let (guard, _d) = guard_with_reply(None);
        let mut opts = LockOptions::new("o", 1);
        opts.obtention_timeout = Duration::from_millis(20);
        let outcome = guard.lock(opts).await;
        assert!(matches!(outcome, LockOutcome::Failed(FailReason::LocalTimeout)));
    }

    #[tokio::test]
    async fn locked_callback_returning_false_unlocks_even_in_extended_mode() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::Locked(
            lockd_core::messages::Locked {
                object_name: "o".into(),
                tag: 0,
                timeout_date: 1_000,
                unlocked_date: 1_005,
            },
        )));
        guard.set_locked_callback(|_| false);
        let mut opts = LockOptions::new("o", 1);
        opts.mode = Mode::Extended;
        let outcome = guard.lock(opts).await;
        assert!(matches!(outcome, LockOutcome::Locked { .. }));
        assert_eq!(guard.state(), GuardState::Idle, "callback returning false must unlock");
    }

    #[tokio::test]
    async fn locked_callback_returning_true_keeps_the_lock_in_simple_mode() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::Locked(
            lockd_core::messages::Locked {
                object_name: "o".into(),
                tag: 0,
                timeout_date: 1_000,
                unlocked_date: 1_005,
            },
        )));
        guard.set_locked_callback(|_| true);
        let mut opts = LockOptions::new("o", 1);
        opts.mode = Mode::Simple;
        guard.lock(opts).await;
        assert_eq!(guard.state(), GuardState::Locked, "callback returning true must keep the lock");
    }

    #[tokio::test]
    async fn failed_callback_fires_on_lock_failure() {
        let (guard, _d) = guard_with_reply(Some(ClientMessage::LockFailed(
            lockd_core::messages::LockFailed {
                object_name: "o".into(),
                tag: 0,
                key: String::new(),
                error: lockd_core::messages::ReasonWire::Duplicate,
                description: None,
            },
        )));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_cb = fired.clone();
        guard.set_failed_callback(move |_| {
            fired_cb.store(true, Ordering::Relaxed);
            true
        });
        guard.lock(LockOptions::new("o", 1)).await;
        assert!(fired.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn begin_lock_runs_to_completion_without_being_awaited() {
        let (guard, dispatcher) = guard_with_reply(Some(ClientMessage::Locked(
            lockd_core::messages::Locked {
                object_name: "o".into(),
                tag: 0,
                timeout_date: 1_000,
                unlocked_date: 1_005,
            },
        )));
        let _ = &dispatcher;
        let notified = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let notified_cb = notified.clone();
        guard.set_locked_callback(move |_| {
            notified_cb.store(true, Ordering::Relaxed);
            true
        });
        let mut opts = LockOptions::new("o", 1);
        opts.mode = Mode::Extended;
        guard.begin_lock(opts);
        for _ in 0..100 {
            if notified.load(Ordering::Relaxed) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(notified.load(Ordering::Relaxed));
        assert_eq!(guard.state(), GuardState::Locked);
    }
}
