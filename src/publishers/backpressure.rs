use crate::broker::Channel;
use crate::lifecycle::HookId;
use crate::publishers::PublisherError;
use crate::transport::{ListenerId, TransportSignal};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capacity {
    Unknown,
    Drained,
    Closed,
}

/// Tracks whether a channel has drained its write buffer since the latch was last armed.
///
/// The latch listens from the moment it is created, so a drain that happens between a send
/// returning [`WriteStatus::BufferFull`](crate::transport::WriteStatus::BufferFull) and the
/// call to [`DrainLatch::wait`] is not lost.
pub(crate) struct DrainLatch<'a> {
    channel: &'a Channel,
    sender: Arc<watch::Sender<Capacity>>,
    capacity: watch::Receiver<Capacity>,
    listener: ListenerId,
    close_hook: HookId,
}

impl<'a> DrainLatch<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        let (sender, capacity) = watch::channel(Capacity::Unknown);
        let sender = Arc::new(sender);

        let drained = Arc::clone(&sender);
        let listener = channel.raw().add_listener(Arc::new(move |signal| {
            if let TransportSignal::Drained = signal {
                drained.send_if_modified(|capacity| {
                    let changed = *capacity == Capacity::Unknown;
                    if changed {
                        *capacity = Capacity::Drained;
                    }
                    changed
                });
            }
        }));
        let closed = Arc::clone(&sender);
        let close_hook = channel.on_close(move || {
            closed.send_replace(Capacity::Closed);
        });

        Self {
            channel,
            sender,
            capacity,
            listener,
            close_hook,
        }
    }

    /// Forget drains observed so far. Call right before every send.
    pub(crate) fn arm(&mut self) {
        self.sender.send_if_modified(|capacity| {
            let changed = *capacity == Capacity::Drained;
            if changed {
                *capacity = Capacity::Unknown;
            }
            changed
        });
    }

    /// Wait until the channel drains, or fail if it closes first.
    pub(crate) async fn wait(&mut self) -> Result<(), PublisherError> {
        loop {
            let capacity = *self.capacity.borrow_and_update();
            match capacity {
                Capacity::Drained => return Ok(()),
                Capacity::Closed => return Err(PublisherError::ClosedWhileWaiting),
                Capacity::Unknown if self.channel.is_closed() => {
                    return Err(PublisherError::ClosedWhileWaiting)
                }
                Capacity::Unknown => {}
            }
            if self.capacity.changed().await.is_err() {
                return Err(PublisherError::ClosedWhileWaiting);
            }
        }
    }
}

impl Drop for DrainLatch<'_> {
    fn drop(&mut self) {
        self.channel.raw().remove_listener(self.listener);
        self.channel.cancel_on_close(self.close_hook);
    }
}
