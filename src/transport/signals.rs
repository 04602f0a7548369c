use crate::transport::TransportError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Something a driver handle reports to whoever is listening.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// The handle hit an error. A `Closed` signal usually follows.
    Error(Arc<TransportError>),
    /// The handle is gone for good. Emitted at most once.
    Closed,
    /// A channel that reported [`WriteStatus::BufferFull`](super::WriteStatus::BufferFull) can
    /// accept writes again.
    Drained,
}

pub type SignalListener = Arc<dyn Fn(&TransportSignal) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A listener registry for driver implementations.
///
/// Listeners are invoked synchronously, outside of the registry lock, so they are free to
/// register or remove listeners themselves.
#[derive(Default)]
pub struct SignalHub {
    listeners: Mutex<Vec<(ListenerId, SignalListener)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: SignalListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn emit(&self, signal: &TransportSignal) {
        let listeners: Vec<SignalListener> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(signal);
        }
    }

    /// Emit [`TransportSignal::Closed`], unless it has already been emitted.
    ///
    /// Returns `true` if this call emitted it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(&TransportSignal::Closed);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, SignalListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
