use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;

/// Why the process is winding down. Attached to the shutdown signal so the
/// serve loop can log what actually stopped a payment server that may still
/// be holding open gateway callbacks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownReason {
    /// Operator interrupt (ctrl-c).
    Interrupt,
    /// Supervisor-initiated stop (SIGTERM, e.g. a rolling deploy).
    Terminate,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// A multi-producer, multi-consumer shutdown channel carrying a
/// [`ShutdownReason`].
///
/// - Clone to get another handle.
/// - Consumers that subscribe after the signal was sent still observe it
///   (unlike [`tokio::sync::broadcast`]).
/// - Sending more than once is safe; the first reason wins.
///
/// Internally the signal is a [`Semaphore`] with zero permits: the reason is
/// stored, then the semaphore is closed, and a waiter's failed `acquire` is
/// the wakeup.
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    gate: Semaphore,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Semaphore::new(0),
                reason: OnceLock::new(),
            }),
        }
    }

    /// Send a shutdown signal, waking every current and future
    /// [`recv`](Self::recv). The first caller's reason sticks.
    pub fn send(&self, reason: ShutdownReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.gate.close();
    }

    /// Wait for a shutdown signal and return its reason.
    /// Returns immediately if the signal was already sent.
    pub async fn recv(&self) -> ShutdownReason {
        if self.inner.gate.acquire().await.is_ok() {
            unreachable!("the gate holds no permits to hand out");
        }
        *self
            .inner
            .reason
            .get()
            .expect("reason is stored before the gate closes")
    }

    /// The reason, if a shutdown signal has been sent.
    pub fn try_recv(&self) -> Option<ShutdownReason> {
        if !self.inner.gate.is_closed() {
            return None;
        }
        self.inner.reason.get().copied()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn recv_observes_the_sent_reason() {
        let channel = ShutdownChannel::new();
        let waiter = channel.clone();
        assert_eq!(waiter.try_recv(), None);

        channel.send(ShutdownReason::Terminate);
        let reason = time::timeout(Duration::from_nanos(1), waiter.recv())
            .await
            .expect("signal should already be observable");
        assert_eq!(reason, ShutdownReason::Terminate);
    }

    #[tokio::test(start_paused = true)]
    async fn first_reason_wins() {
        let channel = ShutdownChannel::new();
        channel.send(ShutdownReason::Interrupt);
        channel.send(ShutdownReason::Terminate);

        assert_eq!(channel.try_recv(), Some(ShutdownReason::Interrupt));
        assert_eq!(channel.recv().await, ShutdownReason::Interrupt);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscribers_still_observe_the_signal() {
        let channel = ShutdownChannel::new();
        channel.send(ShutdownReason::Interrupt);

        // Cloned after the signal was sent.
        let late = channel.clone();
        assert_eq!(late.try_recv(), Some(ShutdownReason::Interrupt));
        let reason = time::timeout(Duration::from_nanos(1), late.recv())
            .await
            .expect("signal should already be observable");
        assert_eq!(reason, ShutdownReason::Interrupt);
    }
}
