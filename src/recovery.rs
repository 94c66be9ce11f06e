//! Timer-driven completion of failed or abandoned transactions.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick};
use log::{debug, error, info, warn};

use crate::errors::{MaatError, Result};

/// Something holding transactions that can be driven to a terminal status
/// from its transaction log.
pub trait Recoverable: Send + Sync {
    /// Name used in logs and in the sweep thread name.
    fn name(&self) -> &str;

    /// Starts tracking every unfinished transaction found in the log.
    /// Returns how many were recovered.
    fn recover_transactions_from_log(&self) -> Result<usize>;

    /// Rolls back or commits tracked transactions that failed or were
    /// abandoned. Returns how many reached a terminal status.
    fn finish_failed_or_abandoned_transactions(&self) -> Result<usize>;
}

/// Background sweep started by [`start_recovery`]. Stops when shut down or dropped.
pub struct RecoverySweep {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RecoverySweep {
    /// Stops the sweep and waits for a running pass to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Dropping the sender wakes the sweep thread.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Recovery sweep of '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for RecoverySweep {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Recovers `target` from its log, finishes abandoned transactions once and
/// then keeps doing so every `interval` on a background thread.
///
/// # Errors
///
/// Fails if the log cannot be read or the sweep thread cannot be started.
/// A failing first pass is only logged, like every later pass.
pub fn start_recovery(target: Arc<dyn Recoverable>, interval: Duration) -> Result<RecoverySweep> {
    let name = target.name().to_string();
    let recovered = target.recover_transactions_from_log()?;
    info!("'{}' recovered {} transactions, running first sweep", name, recovered);
    sweep(target.as_ref());

    let (stop, stopped) = bounded::<()>(0);
    let thread_name = format!("transaction-recovery-{name}");
    let thread = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => sweep(target.as_ref()),
                    recv(stopped) -> _ => break,
                }
            }
            debug!("Recovery sweep of '{}' stopped", target.name());
        })
        .map_err(|e| MaatError::Resource(format!("cannot start recovery sweep of '{name}': {e}")))?;

    Ok(RecoverySweep {
        name,
        stop: Some(stop),
        thread: Some(thread),
    })
}

fn sweep(target: &dyn Recoverable) {
    match target.finish_failed_or_abandoned_transactions() {
        Ok(0) => debug!("Sweep of '{}' found nothing to finish", target.name()),
        Ok(finished) => info!("Sweep of '{}' finished {} transactions", target.name(), finished),
        Err(e) => warn!("Sweep of '{}' failed: {}", target.name(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Counting {
        recoveries: AtomicUsize,
        sweeps: AtomicUsize,
    }

    impl Recoverable for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn recover_transactions_from_log(&self) -> Result<usize> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        fn finish_failed_or_abandoned_transactions(&self) -> Result<usize> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[test]
    fn runs_first_pass_synchronously_then_periodically() {
        let target = Arc::new(Counting::default());
        let sweep = start_recovery(target.clone(), Duration::from_millis(10)).unwrap();

        assert_eq!(target.recoveries.load(Ordering::SeqCst), 1);
        assert!(target.sweeps.load(Ordering::SeqCst) >= 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while target.sweeps.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sweep.shutdown();

        let after_shutdown = target.sweeps.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.sweeps.load(Ordering::SeqCst), after_shutdown);
    }
}
