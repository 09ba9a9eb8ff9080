use std::{future::Future, time::Duration};

use tokio::{sync::mpsc, time::timeout};

/// Coalesces bursts of triggers into a single run of `job`, fired once no
/// trigger has arrived for `delay`.
///
/// The worker exits when every `Debouncer` handle has been dropped; a burst
/// still pending at that point is flushed before exiting.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(delay: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let mut closed = false;
                loop {
                    match timeout(delay, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                job().await;

                if closed {
                    break;
                }
            }
            tracing::trace!("debounce worker exiting");
        });

        Self { tx }
    }

    pub fn trigger(&self) {
        if self.tx.send(()).is_err() {
            tracing::debug!("debounce worker gone; trigger dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::time::sleep;

    use super::*;

    fn counting(delay: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let debouncer = Debouncer::spawn(delay, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (debouncer, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_triggers_coalesce_into_one_run() {
        let (debouncer, runs) = counting(Duration::from_millis(300));

        for _ in 0..5 {
            debouncer.trigger();
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separated_bursts_each_run() {
        let (debouncer, runs) = counting(Duration::from_millis(100));

        debouncer.trigger();
        sleep(Duration::from_millis(250)).await;
        debouncer.trigger();
        debouncer.trigger();
        sleep(Duration::from_millis(250)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_trigger_means_no_run() {
        let (_debouncer, runs) = counting(Duration::from_millis(100));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
