use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::Mutex;

use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue closed")]
    Closed,
}

/// Producer side of the bounded dispatch queue.
#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<Request>,
}

/// A reserved slot; sending through it cannot fail or block.
pub struct QueueSlot {
    permit: OwnedPermit<Request>,
}

impl QueueSlot {
    pub fn send(self, request: Request) {
        let _ = self.permit.send(request);
    }
}

/// Consumer side shared by every worker.
#[derive(Clone, Debug)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Request>>>,
}

pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl QueueSender {
    /// Reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<QueueSlot, QueueError> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    #[cfg(test)]
    pub fn try_send(&self, request: Request) -> Result<(), QueueError> {
        self.try_reserve()?.send(request);
        Ok(())
    }

    /// Buffered plus reserved slots.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl QueueReceiver {
    /// Next request in FIFO order; `None` once every sender is gone and the
    /// buffer is empty.
    pub async fn recv(&self) -> Option<Request> {
        self.rx.lock().await.recv().await
    }

    /// Refuse new reservations, then collect everything still buffered or
    /// held in an outstanding slot. Returns once every slot is used or
    /// dropped.
    pub async fn close_and_drain(&self) -> Vec<Request> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut out = Vec::new();
        while let Some(req) = rx.recv().await {
            out.push(req);
        }
        out
    }
}
