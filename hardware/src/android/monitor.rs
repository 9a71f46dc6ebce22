//! Periodic background check, stopped and joined on drop.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::debug;

/// Runs a check on a background thread every `interval`.
///
/// The check used by the camera controller closes the camera app once it
/// has been idle too long. Dropping the monitor stops the thread and waits
/// for any check in progress to finish.
pub struct IdleMonitor {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicUsize>,
}

impl IdleMonitor {
    /// Start the thread. The first check runs one `interval` after spawning.
    pub fn spawn<F>(interval: Duration, mut check: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        let handle = thread::Builder::new()
            .name("camera-idle-monitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        check();
                        ticks_clone.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        debug!("Idle monitor started, checking every {interval:?}");
        Ok(Self {
            stop_tx,
            handle: Some(handle),
            ticks,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Checks completed so far.
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if handle.join().is_err() {
            debug!("Idle monitor thread panicked");
        }
        debug!("Idle monitor stopped after {} checks", self.ticks());
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_runs_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut monitor = IdleMonitor::spawn(Duration::from_millis(5), move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.ticks() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
        let after_stop = calls.load(Ordering::Relaxed);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_drop_stops_promptly_with_long_interval() {
        let monitor = IdleMonitor::spawn(Duration::from_secs(3600), || {}).unwrap();
        let start = Instant::now();
        drop(monitor);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
