use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Broadcast "something changed" signal of one connection: a request
/// finished or the link changed state.
///
/// Waiters register with `listen` *before* checking the condition they care
/// about, then await the listener. Dropping a listener unregisters it.
#[derive(Debug, Default)]
pub struct ReadySignal {
    notify: Notify,
}

impl ReadySignal {
    pub fn new() -> Self {
        ReadySignal {
            notify: Notify::new(),
        }
    }

    pub fn listen(&self) -> Listener<'_> {
        let mut notified = Box::pin(self.notify.notified());
        // Registered now, so a notify between here and the first poll is kept.
        notified.as_mut().enable();
        Listener { notified }
    }

    /// Wake every registered listener. Listeners created afterwards are not
    /// affected.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }
}

/// One registration on a `ReadySignal`.
pub struct Listener<'a> {
    notified: Pin<Box<Notified<'a>>>,
}

impl Future for Listener<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.get_mut().notified.as_mut().poll(cx)
    }
}

/// Resolve when the first of the listeners fires. The rest are dropped, and
/// with them their registrations. An empty set resolves immediately.
pub async fn wait_any(mut listeners: Vec<Listener<'_>>) {
    if listeners.is_empty() {
        return;
    }
    poll_fn(|cx| {
        for listener in listeners.iter_mut() {
            if Pin::new(listener).poll(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_before_await_is_not_lost() {
        let signal = ReadySignal::new();
        let listener = signal.listen();
        signal.notify();
        tokio::time::timeout(Duration::from_millis(100), listener)
            .await
            .expect("listener should have fired");
    }

    #[tokio::test]
    async fn test_late_listener_misses_earlier_notify() {
        let signal = ReadySignal::new();
        signal.notify();
        let listener = signal.listen();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), listener)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_wait_any_fires_on_first() {
        let signals: Arc<Vec<ReadySignal>> = Arc::new((0..3).map(|_| ReadySignal::new()).collect());
        let waker = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waker[2].notify();
        });
        let listeners = signals.iter().map(|s| s.listen()).collect();
        tokio::time::timeout(Duration::from_secs(1), wait_any(listeners))
            .await
            .expect("wait_any should resolve");
    }
}
