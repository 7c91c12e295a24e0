//! Worker-fed event channels. A provider hands back the receiving half plus the
//! worker future; the caller decides where the worker runs.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use super::events::StreamEventMapped;
use super::pull::PullEvent;

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving half of a worker channel. Dropping it tells the worker to stop.
pub struct EventStream<T> {
    events: mpsc::UnboundedReceiver<T>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl<T> EventStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    /// Returns true when the worker was still listening for the signal.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .is_some_and(|cancel_tx| cancel_tx.send(()).is_ok())
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct StreamHandle<T> {
    pub events: EventStream<T>,
    pub worker: ProviderWorker,
}

pub type ChatStreamHandle = StreamHandle<StreamEventMapped>;
pub type PullHandle = StreamHandle<PullEvent>;

/// Sending half given to a worker: it emits on `events` and watches `cancelled`.
pub struct WorkerSide<T> {
    pub events: mpsc::UnboundedSender<T>,
    pub cancelled: oneshot::Receiver<()>,
}

pub fn event_channel<T>() -> (WorkerSide<T>, EventStream<T>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        WorkerSide {
            events: event_tx,
            cancelled: cancel_rx,
        },
        EventStream {
            events: event_rx,
            cancel_tx: Some(cancel_tx),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_then_close() {
        let (worker, mut stream) = event_channel::<u32>();
        for value in [1, 2, 3] {
            worker.events.send(value).expect("receiver alive");
        }
        drop(worker);

        let mut received = Vec::new();
        while let Some(value) = stream.recv().await {
            received.push(value);
        }
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_worker() {
        let (worker, stream) = event_channel::<u32>();
        drop(stream);
        assert!(worker.cancelled.await.is_ok());
    }

    #[test]
    fn cancel_fires_once() {
        let (_worker, mut stream) = event_channel::<u32>();
        assert!(stream.cancel());
        assert!(!stream.cancel());
    }
}
