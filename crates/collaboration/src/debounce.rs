/// Trailing-edge debouncing of writes
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// How a pushed value was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceOutcome {
    /// The value was handed to the write function
    Fired,
    /// A later push replaced the value before the window elapsed
    Superseded,
}

enum Command<T> {
    Push(T, oneshot::Sender<DebounceOutcome>),
    Flush(oneshot::Sender<()>),
}

/// Collapses bursts of values into one write of the latest value
///
/// Every push restarts the quiescence window. Writes run one at a time on a
/// background task in push order.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    outstanding: Arc<AtomicUsize>,
    wait: Duration,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F, Fut>(wait: Duration, write: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run(rx, wait, write, outstanding.clone()));
        Self {
            tx,
            outstanding,
            wait,
        }
    }

    /// Queue `value`, replacing whatever was pending
    pub fn push(&self, value: T) -> oneshot::Receiver<DebounceOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Command::Push(value, done_tx)).is_err() {
            // Worker is gone; the receiver resolves as closed
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        done_rx
    }

    /// Write the pending value now and wait for it to finish
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// No value is waiting or being written
    pub fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

async fn run<T, F, Fut>(
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    wait: Duration,
    mut write: F,
    outstanding: Arc<AtomicUsize>,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending: Option<(T, oneshot::Sender<DebounceOutcome>)> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                _ = sleep_until(at) => {
                    deadline = None;
                    if let Some((value, done)) = pending.take() {
                        write(value).await;
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        let _ = done.send(DebounceOutcome::Fired);
                    }
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Push(value, done)) => {
                if let Some((_, superseded)) = pending.replace((value, done)) {
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = superseded.send(DebounceOutcome::Superseded);
                }
                deadline = Some(Instant::now() + wait);
            }
            Some(Command::Flush(ack)) => {
                deadline = None;
                if let Some((value, done)) = pending.take() {
                    write(value).await;
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = done.send(DebounceOutcome::Fired);
                }
                let _ = ack.send(());
            }
            None => {
                if let Some((value, done)) = pending.take() {
                    debug!("Flushing pending write on shutdown");
                    write(value).await;
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = done.send(DebounceOutcome::Fired);
                }
                break;
            }
        }
    }
}
