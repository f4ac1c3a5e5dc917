//! Per-connection heartbeat timer, activated by a single `WantHeartbeat`.
//!
//! Mirrors the teacher's `Heartbeat` helper: a `tokio::time::Interval` is
//! built lazily once the client picks a nonzero period, and `tick()`
//! never resolves before activation (or when the chosen interval is 0)
//! so it can sit in a `tokio::select!` arm unconditionally.

use std::future;

use tokio::time::{self, Duration, Instant, Interval};

#[derive(Debug, thiserror::Error)]
#[error("a connection may only send WantHeartbeat once")]
pub struct AlreadyActivated;

#[derive(Default)]
pub struct Heartbeat {
    activated: bool,
    interval: Option<Interval>,
}

impl Heartbeat {
    /// Consume the one-time `WantHeartbeat` permission. `interval` is in
    /// deciseconds; `0` disables heartbeats but still consumes the
    /// permission, so a second `WantHeartbeat` is an error regardless of
    /// either interval's value.
    pub fn activate(&mut self, interval_deciseconds: u32) -> Result<(), AlreadyActivated> {
        if self.activated {
            return Err(AlreadyActivated);
        }
        self.activated = true;

        if interval_deciseconds != 0 {
            let period = Duration::from_millis(u64::from(interval_deciseconds) * 100);
            self.interval = Some(time::interval_at(Instant::now() + period, period));
        }

        Ok(())
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Resolves once per configured period. Never resolves if no
    /// nonzero interval was activated, so it is always safe to poll
    /// inside a `select!` arm.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_activation_is_rejected_even_with_zero_interval() {
        let mut hb = Heartbeat::default();
        hb.activate(0).unwrap();
        assert!(hb.activate(10).is_err());
    }

    #[tokio::test]
    async fn zero_interval_never_ticks() {
        let mut hb = Heartbeat::default();
        hb.activate(0).unwrap();
        tokio::select! {
            () = hb.tick() => panic!("zero interval should never tick"),
            () = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}
