//! Non-blocking progress reporting.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delivers values to a callback on a background task through a bounded
/// channel. [`Reporter::update`] never blocks; when the channel is full the
/// value is dropped.
pub struct Reporter<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    done: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Reporter<T> {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new<F>(buffer: usize, mut callback: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(buffer.max(1));
        let done = CancellationToken::new();
        let stop = done.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(v) => callback(v),
                        None => break,
                    },
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            done,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `value`. Returns false when it was dropped.
    pub fn update(&self, value: T) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(tx) => tx.try_send(value).is_ok(),
            None => false,
        }
    }

    /// Close the channel and wait for the worker. With `drain` the queued
    /// values are delivered first; without it the worker exits at once.
    /// Later calls do nothing.
    pub async fn stop(&self, drain: bool) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if !drain {
            self.done.cancel();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl<T> Drop for Reporter<T> {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
