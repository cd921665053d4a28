//! Run many producers concurrently and yield their results in completion
//! order.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::DispatchError;

/// Cap on producers running at once.
#[derive(Clone)]
pub enum Limit {
    Unlimited,
    Gate(Arc<Semaphore>),
}

impl Limit {
    /// `0` means unlimited.
    pub fn new(permits: usize) -> Self {
        if permits == 0 {
            Limit::Unlimited
        } else {
            Limit::Gate(Arc::new(Semaphore::new(permits)))
        }
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self {
            Limit::Unlimited => None,
            Limit::Gate(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        }
    }
}

impl Default for Limit {
    fn default() -> Self {
        Limit::new(30)
    }
}

impl fmt::Debug for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "Unlimited"),
            Limit::Gate(s) => write!(f, "Gate({} available)", s.available_permits()),
        }
    }
}

/// One finished producer.
#[derive(Debug)]
pub struct StreamResult<C, T> {
    pub context: C,
    pub value: Result<T, DispatchError>,
}

impl<C, T> StreamResult<C, T> {
    pub fn successful(&self) -> bool {
        self.value.is_ok()
    }
}

/// Stream of producer results. Ends once `no_more_work` has been called and
/// every producer has finished. Dropping it aborts whatever is still running.
pub struct ResultStreamer<C, T> {
    tx: Option<mpsc::UnboundedSender<StreamResult<C, T>>>,
    rx: mpsc::UnboundedReceiver<StreamResult<C, T>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    limit: Limit,
}

impl<C, T> ResultStreamer<C, T>
where
    C: Send + 'static,
    T: Send + 'static,
{
    pub fn new(limit: Limit) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx,
            tasks: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    /// Start `producer` once a permit is free. A panic becomes a failed
    /// result for `context`.
    pub fn add<F>(&mut self, context: C, producer: F)
    where
        F: Future<Output = Result<T, DispatchError>> + Send + 'static,
    {
        let Some(tx) = self.tx.clone() else {
            warn!("producer added after no_more_work, ignoring");
            return;
        };
        let limit = self.limit.clone();
        let handle = tokio::spawn(async move {
            let _permit = limit.acquire().await;
            let value = match AssertUnwindSafe(producer).catch_unwind().await {
                Ok(value) => value,
                Err(panic) => Err(DispatchError::Panicked(panic_message(panic))),
            };
            let _ = tx.send(StreamResult { context, value });
        });
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// No further producers will be added.
    pub fn no_more_work(&mut self) {
        self.tx = None;
    }

    pub async fn next(&mut self) -> Option<StreamResult<C, T>> {
        self.rx.recv().await
    }
}

impl<C, T> Drop for ResultStreamer<C, T> {
    fn drop(&mut self) {
        let tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.iter() {
            task.abort();
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn yields_in_completion_order() {
        let mut streamer = ResultStreamer::new(Limit::Unlimited);
        for (name, delay) in [("slow", 300), ("fast", 100), ("middle", 200)] {
            streamer.add(name, async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            });
        }
        streamer.no_more_work();
        let mut order = Vec::new();
        while let Some(r) = streamer.next().await {
            assert!(r.successful());
            order.push(r.context);
        }
        assert_eq!(order, vec!["fast", "middle", "slow"]);
    }

    fn explode() -> Result<(), DispatchError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn failures_are_results() {
        let mut streamer = ResultStreamer::<u8, ()>::new(Limit::default());
        streamer.add(1, async { Err(DispatchError::FoundNoDevices) });
        streamer.add(2, async { explode() });
        streamer.no_more_work();
        let mut failed = Vec::new();
        while let Some(r) = streamer.next().await {
            failed.push((r.context, r.value.unwrap_err().to_string()));
        }
        failed.sort();
        assert_eq!(failed[0], (1, "found no devices".to_string()));
        assert_eq!(failed[1], (2, "producer panicked: boom".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_caps_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut streamer = ResultStreamer::new(Limit::new(2));
        for i in 0..5 {
            let running = running.clone();
            let peak = peak.clone();
            streamer.add(i, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        streamer.no_more_work();
        let mut count = 0;
        while streamer.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_aborts_producers() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut streamer = ResultStreamer::<(), ()>::new(Limit::Unlimited);
        let f = finished.clone();
        streamer.add((), async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drop(streamer);
        tokio::task::yield_now().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
