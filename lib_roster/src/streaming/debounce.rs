//! Debounced emitter.
//!
//! Values pushed with `emit` are buffered; the most recent one is forwarded to
//! the sink once no new value arrived for the quiet period. Dropping the
//! `Debouncer` (or calling `cancel`) discards whatever is still pending.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
    shutdown: CancellationToken,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawns the timer task. Must be called inside a tokio runtime.
    pub fn new<F>(quiet: Duration, mut sink: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tokio::spawn(async move {
            let mut pending: Option<T> = None;
            loop {
                match pending.take() {
                    None => tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = rx.recv() => match next {
                            Some(value) => pending = Some(value),
                            None => break,
                        },
                    },
                    Some(value) => tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = rx.recv() => match next {
                            // A newer value restarts the quiet period.
                            Some(newer) => pending = Some(newer),
                            None => break,
                        },
                        _ = tokio::time::sleep(quiet) => sink(value),
                    },
                }
            }
            log::trace!("Debouncer task stopped");
        });

        Self { tx, shutdown }
    }

    pub fn emit(&self, value: T) {
        // Only fails after cancel, when the value is meant to be dropped anyway.
        let _ = self.tx.send(value);
    }

    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(String) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |v| sink_seen.lock().unwrap().push(v))
    }

    #[tokio::test(start_paused = true)]
    async fn only_last_value_of_a_burst_is_forwarded() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(200), sink);

        debouncer.emit("t".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.emit("to".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.emit("tok".to_string());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["tok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_discards_pending_value() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(200), sink);

        debouncer.emit("pending".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
