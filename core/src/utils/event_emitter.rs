/// Event emitter for lifecycle signals
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

pub struct EventEmitter<T> {
    source: String,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Debug> EventEmitter<T> {
    pub fn new(source: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            source: source.into(),
            tx,
        }
    }

    /// Publish to every current subscriber; nobody listening is fine
    pub fn emit(&self, event: T) {
        debug!("[{}] {:?}", self.source, event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            tx: self.tx.clone(),
        }
    }
}
