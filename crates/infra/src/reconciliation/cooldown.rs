use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::shutdown::Shutdown;

/// Longest pause the gate will hold, whatever the caller asks for.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Pipeline-wide pause triggered by the accrual service's busy signal.
///
/// The accrual service enforces one shared rate limit, so a busy answer for any
/// order pauses every further query until the cooldown has elapsed. Repeated
/// signals only ever extend the pause.
#[derive(Debug, Default)]
pub struct CooldownGate {
    until: Mutex<Option<Instant>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        self.until.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pause for `cooldown` from now (at most [`MAX_COOLDOWN`]); returns the
    /// effective deadline.
    pub fn trip(&self, cooldown: Duration) -> Instant {
        let now = Instant::now();
        let candidate = now
            .checked_add(cooldown.min(MAX_COOLDOWN))
            .unwrap_or(now);
        let mut until = self.deadline();
        let effective = match *until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        *until = Some(effective);
        effective
    }

    /// Deadline of the current pause, if one is still running.
    pub fn paused_until(&self) -> Option<Instant> {
        let until = *self.deadline();
        until.filter(|deadline| *deadline > Instant::now())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.paused_until()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until().is_some()
    }

    /// Wait until no pause is active.
    ///
    /// Returns `false` if `shutdown` fires first.
    pub async fn wait_ready(&self, shutdown: &Shutdown) -> bool {
        loop {
            if shutdown.is_triggered() {
                return false;
            }
            let Some(deadline) = self.paused_until() else {
                return true;
            };
            tokio::select! {
                _ = shutdown.triggered() => return false,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_out_the_cooldown() {
        let gate = CooldownGate::new();
        let shutdown = Shutdown::new();
        assert!(!gate.is_paused());

        let start = Instant::now();
        gate.trip(Duration::from_secs(60));
        assert!(gate.wait_ready(&shutdown).await);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(!gate.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_signal_never_shortens_pause() {
        let gate = CooldownGate::new();
        let long = gate.trip(Duration::from_secs(60));
        let effective = gate.trip(Duration::from_secs(5));
        assert_eq!(effective, long);
        assert!(gate.remaining().unwrap() > Duration::from_secs(55));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_cooldown_is_capped_instead_of_overflowing() {
        let gate = CooldownGate::new();
        let start = Instant::now();

        let deadline = gate.trip(Duration::from_secs(u64::MAX));
        assert_eq!(deadline, start + MAX_COOLDOWN);
        assert_eq!(gate.remaining(), Some(MAX_COOLDOWN));

        let again = gate.trip(Duration::MAX);
        assert_eq!(again, deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_wait() {
        let gate = CooldownGate::new();
        let shutdown = Shutdown::new();
        gate.trip(Duration::from_secs(3600));

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(!gate.wait_ready(&shutdown).await);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }
}
