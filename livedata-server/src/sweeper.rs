//! Background TTL sweep.
//!
//! The sweeper holds only a weak reference to its target and exits once the
//! target is dropped. The target is locked for the whole sweep, so a sweep
//! never observes a view halfway through a mutation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Something that can drop idle entries.
pub trait Sweep {
    /// Drop every entry idle for longer than its TTL as of `now`; returns how
    /// many were dropped.
    fn sweep_expired(&mut self, now: Instant) -> usize;

    fn cleanup_interval(&self) -> Duration;
}

/// Run `target.sweep_expired` every `cleanup_interval` until `target` is
/// dropped. A zero interval disables the sweep.
pub fn spawn_cleanup<T>(target: &Arc<Mutex<T>>) -> JoinHandle<()>
where
    T: Sweep + Send + 'static,
{
    let weak = Arc::downgrade(target);
    tokio::spawn(async move {
        let period = match weak.upgrade() {
            Some(target) => target.lock().await.cleanup_interval(),
            None => return,
        };
        if period.is_zero() {
            debug!("Cleanup interval is zero, sweeper not started");
            return;
        }

        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = weak.upgrade() else {
                debug!("Sweep target dropped, sweeper exiting");
                break;
            };
            let swept = target.lock().await.sweep_expired(Instant::now());
            if swept > 0 {
                debug!("Sweeper dropped {swept} idle documents");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        sweeps: usize,
        interval: Duration,
    }

    impl Sweep for Counter {
        fn sweep_expired(&mut self, _now: Instant) -> usize {
            self.sweeps += 1;
            0
        }

        fn cleanup_interval(&self) -> Duration {
            self.interval
        }
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_exits_on_drop() {
        let target = Arc::new(Mutex::new(Counter {
            sweeps: 0,
            interval: Duration::from_millis(10),
        }));
        let handle = spawn_cleanup(&target);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(target.lock().await.sweeps >= 2);

        drop(target);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_disables_sweeper() {
        let target = Arc::new(Mutex::new(Counter {
            sweeps: 0,
            interval: Duration::ZERO,
        }));
        spawn_cleanup(&target).await.unwrap();
        assert_eq!(target.lock().await.sweeps, 0);
    }
}
