use crate::handshake::HalfOpenCounter;
use crate::status::{RotationOutcome, SyncookieStatus};
use rand::rngs::OsRng;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const REQUEST_NONE: u8 = 0;
const REQUEST_RUN_NOW: u8 = 1;
const REQUEST_REARM: u8 = 2;

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;

/// Pending request for the rotator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationRequest {
    /// Run a tick immediately
    RunNow,
    /// Restart the timer with a full interval
    Rearm,
}

/// Single-slot mailbox between the packet path and the rotator task
#[derive(Debug, Default)]
pub struct RotationSchedule {
    request: AtomicU8,
    notify: Notify,
}

impl RotationSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for an immediate tick. Overrides a pending re-arm.
    pub fn kick(&self) {
        self.request.store(REQUEST_RUN_NOW, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Ask for the timer to restart. A pending immediate tick wins.
    pub fn rearm(&self) {
        let _ = self.request.compare_exchange(
            REQUEST_NONE,
            REQUEST_REARM,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.notify.notify_one();
    }

    /// Take the pending request, leaving the mailbox empty
    pub fn take(&self) -> Option<RotationRequest> {
        match self.request.swap(REQUEST_NONE, Ordering::SeqCst) {
            REQUEST_RUN_NOW => Some(RotationRequest::RunNow),
            REQUEST_REARM => Some(RotationRequest::Rearm),
            _ => None,
        }
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Whether the rotator has a tick scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatorState {
    Running,
    Stopped,
}

/// Handle to the spawned rotation task
pub struct KeyRotator {
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl KeyRotator {
    /// Spawn the rotator in the `Stopped` state; it starts on the first request
    pub fn spawn(
        status: Arc<SyncookieStatus>,
        half_open: Arc<dyn HalfOpenCounter>,
        schedule: Arc<RotationSchedule>,
        lifetime: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(STATE_STOPPED));
        let task_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            let tick = || match status.rotate(half_open.half_open_count(), &mut OsRng) {
                RotationOutcome::Rotated { slot } => {
                    debug!(slot, "Rotation tick");
                    Some(Instant::now() + lifetime)
                }
                RotationOutcome::Stopped => {
                    info!("Syncookie rotation stopped");
                    None
                }
            };

            let mut deadline: Option<Instant> = None;

            loop {
                task_state.store(
                    if deadline.is_some() {
                        STATE_RUNNING
                    } else {
                        STATE_STOPPED
                    },
                    Ordering::SeqCst,
                );

                let timer_fired = match deadline {
                    Some(at) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep_until(at) => true,
                        _ = schedule.notified() => false,
                    },
                    None => tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = schedule.notified() => false,
                    },
                };

                if timer_fired {
                    deadline = tick();
                    // A request posted alongside the timer is satisfied by this tick
                    if let Some(RotationRequest::Rearm) = schedule.take() {
                        deadline = Some(Instant::now() + lifetime);
                    }
                    continue;
                }

                match schedule.take() {
                    Some(RotationRequest::RunNow) => deadline = tick(),
                    Some(RotationRequest::Rearm) => deadline = Some(Instant::now() + lifetime),
                    None => {}
                }
            }

            task_state.store(STATE_STOPPED, Ordering::SeqCst);
            debug!("Key rotator exited");
        });

        Self { state, handle }
    }

    pub fn state(&self) -> RotatorState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => RotatorState::Running,
            _ => RotatorState::Stopped,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to exit after its cancellation token fired
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SyncookieMode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicU64;

    const LIFETIME: Duration = Duration::from_secs(15);

    struct Fixture {
        status: Arc<SyncookieStatus>,
        half_open: Arc<AtomicU64>,
        schedule: Arc<RotationSchedule>,
        cancel: CancellationToken,
        rotator: KeyRotator,
    }

    fn fixture() -> Fixture {
        let status = Arc::new(SyncookieStatus::new(100, 50).unwrap());
        let half_open = Arc::new(AtomicU64::new(0));
        let schedule = Arc::new(RotationSchedule::new());
        let cancel = CancellationToken::new();
        let rotator = KeyRotator::spawn(
            Arc::clone(&status),
            half_open.clone(),
            Arc::clone(&schedule),
            LIFETIME,
            cancel.clone(),
        );
        Fixture {
            status,
            half_open,
            schedule,
            cancel,
            rotator,
        }
    }

    /// Let the rotator task run until it parks again
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_schedule_mailbox() {
        let schedule = RotationSchedule::new();
        assert_eq!(schedule.take(), None);

        schedule.rearm();
        assert_eq!(schedule.take(), Some(RotationRequest::Rearm));

        schedule.rearm();
        schedule.kick();
        assert_eq!(schedule.take(), Some(RotationRequest::RunNow));

        schedule.kick();
        schedule.rearm();
        assert_eq!(schedule.take(), Some(RotationRequest::RunNow));
        assert_eq!(schedule.take(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_stopped() {
        let f = fixture();
        settle().await;
        assert_eq!(f.rotator.state(), RotatorState::Stopped);

        tokio::time::sleep(LIFETIME * 3).await;
        assert_eq!(f.status.current_slot(), 0);

        f.cancel.cancel();
        f.rotator.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_mints_key_and_runs() {
        let f = fixture();
        f.status
            .set_mode(SyncookieMode::Adaptive, 100, 50, &mut StdRng::seed_from_u64(7))
            .unwrap();
        f.half_open.store(150, Ordering::SeqCst);

        let decision = f.status.check_flood(false, 150);
        assert!(decision.kick_rotation);
        assert!(!f.status.snapshot().keys_present);

        f.schedule.kick();
        settle().await;
        assert!(f.status.snapshot().keys_present);
        assert_eq!(f.status.current_slot(), 1);
        assert_eq!(f.rotator.state(), RotatorState::Running);

        tokio::time::sleep(LIFETIME + Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(f.status.current_slot(), 0);

        f.cancel.cancel();
        f.rotator.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_flood_subsides() {
        let f = fixture();
        f.status
            .set_mode(SyncookieMode::Adaptive, 100, 50, &mut StdRng::seed_from_u64(7))
            .unwrap();
        f.half_open.store(150, Ordering::SeqCst);
        f.status.check_flood(false, 150);
        f.schedule.kick();
        settle().await;
        assert_eq!(f.rotator.state(), RotatorState::Running);
        assert!(f.status.snapshot().keys_present);

        f.half_open.store(10, Ordering::SeqCst);
        tokio::time::sleep(LIFETIME + Duration::from_millis(1)).await;
        settle().await;

        assert!(!f.status.is_active());
        assert!(!f.status.snapshot().keys_present);
        assert_eq!(f.rotator.state(), RotatorState::Stopped);

        f.cancel.cancel();
        f.rotator.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_restarts_interval() {
        let f = fixture();
        let rearm = f
            .status
            .set_mode(SyncookieMode::Always, 100, 50, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert!(rearm);
        f.schedule.rearm();
        settle().await;
        assert_eq!(f.rotator.state(), RotatorState::Running);
        assert_eq!(f.status.current_slot(), 1);

        tokio::time::sleep(LIFETIME - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(f.status.current_slot(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(f.status.current_slot(), 0);

        f.cancel.cancel();
        f.rotator.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_exits() {
        let f = fixture();
        f.cancel.cancel();
        settle().await;
        assert!(f.rotator.is_finished());
        assert_eq!(f.rotator.state(), RotatorState::Stopped);
    }
}
