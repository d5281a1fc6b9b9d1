//! Request/response correlation.
//!
//! A [`PendingRequest`] races two tasks: a matcher that feeds inbound
//! packets through the caller's predicate, and a timer. Both must win an
//! atomic claim before acting, so exactly one of them resolves the request
//! and the other becomes a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument, Span};
use uuid::Uuid;

use crate::error::HubError;
use crate::packet::Packet;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Predicate = Box<dyn FnMut(&Packet) -> bool + Send>;
type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// What to wait for after sending a request.
pub struct AwaitResponse {
    expected_id: Option<Uuid>,
    timeout: Duration,
    predicate: Predicate,
    on_timeout: Option<TimeoutCallback>,
}

impl fmt::Debug for AwaitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitResponse")
            .field("expected_id", &self.expected_id)
            .field("timeout", &self.timeout)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

impl AwaitResponse {
    /// Resolve on the first inbound packet for which `predicate` returns
    /// `true`. Packets it rejects keep the request open.
    pub fn new(predicate: impl FnMut(&Packet) -> bool + Send + 'static) -> Self {
        Self {
            expected_id: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            predicate: Box::new(predicate),
            on_timeout: None,
        }
    }

    /// Accept any packet.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Only consider packets whose id is `id`.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.expected_id = Some(id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `callback` once if the request times out.
    pub fn on_timeout(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Satisfied(Packet),
    TimedOut,
}

impl RequestOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied(_))
    }

    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Self::Satisfied(packet) => Some(packet),
            Self::TimedOut => None,
        }
    }
}

#[derive(Default)]
struct Resolution {
    resolved: AtomicBool,
    outcome: Mutex<Option<oneshot::Sender<RequestOutcome>>>,
}

impl Resolution {
    /// Exactly one caller ever gets `true`.
    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deliver(&self, outcome: RequestOutcome) {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(outcome);
        }
    }
}

/// A registered wait for a response. Register before sending the request
/// so a fast reply cannot slip past.
///
/// Dropping an unresolved request abandons it: the timer and matcher stop
/// and the timeout callback never runs.
pub struct PendingRequest {
    resolution: Arc<Resolution>,
    stop_matching: CancellationToken,
    timer: AbortHandle,
    outcome: oneshot::Receiver<RequestOutcome>,
}

impl PendingRequest {
    pub fn register<S>(incoming: S, request: AwaitResponse, span: Span) -> Self
    where
        S: Stream<Item = Packet> + Send + 'static,
    {
        let AwaitResponse {
            expected_id,
            timeout,
            mut predicate,
            on_timeout,
        } = request;

        let (tx, rx) = oneshot::channel();
        let resolution = Arc::new(Resolution {
            resolved: AtomicBool::new(false),
            outcome: Mutex::new(Some(tx)),
        });
        let stop_matching = CancellationToken::new();

        let timer = {
            let resolution = Arc::clone(&resolution);
            let stop_matching = stop_matching.clone();
            tokio::spawn(
                async move {
                    tokio::time::sleep(timeout).await;
                    if resolution.claim() {
                        stop_matching.cancel();
                        debug!(?timeout, "request timed out");
                        if let Some(callback) = on_timeout {
                            callback();
                        }
                        resolution.deliver(RequestOutcome::TimedOut);
                    }
                }
                .instrument(span.clone()),
            )
        };
        let timer_abort = timer.abort_handle();

        {
            let resolution = Arc::clone(&resolution);
            let stop_matching = stop_matching.clone();
            let mut incoming = Box::pin(incoming);
            tokio::spawn(
                async move {
                    loop {
                        let packet = tokio::select! {
                            biased;
                            _ = stop_matching.cancelled() => return,
                            next = incoming.next() => match next {
                                Some(packet) => packet,
                                None => return,
                            },
                        };
                        if resolution.is_resolved() {
                            return;
                        }
                        if expected_id.is_some_and(|id| id != packet.id) {
                            continue;
                        }
                        if !predicate(&packet) {
                            continue;
                        }
                        if resolution.claim() {
                            timer.abort();
                            resolution.deliver(RequestOutcome::Satisfied(packet));
                        }
                        return;
                    }
                }
                .instrument(span),
            );
        }

        Self {
            resolution,
            stop_matching,
            timer: timer_abort,
            outcome: rx,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_resolved()
    }

    /// Wait for whichever side wins.
    pub async fn outcome(mut self) -> Result<RequestOutcome, HubError> {
        Ok((&mut self.outcome).await?)
    }

    /// Abandon the request without running the timeout callback.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.resolution.claim() {
            self.timer.abort();
            self.stop_matching.cancel();
            debug!("request abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::message::{Command, CommandType};

    fn custom(name: &str) -> Packet {
        Packet::new(Command {
            command_type: CommandType::Custom(name.into()),
        })
    }

    fn is_named(packet: &Packet, name: &str) -> bool {
        packet.summary().contains(name)
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_before_timeout_resolves_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let request = {
            let timeouts = Arc::clone(&timeouts);
            let calls = Arc::clone(&calls);
            AwaitResponse::new(move |p| {
                calls.fetch_add(1, Ordering::SeqCst);
                is_named(p, "pong")
            })
            .with_timeout(Duration::from_secs(5))
            .on_timeout(move || {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pending =
            PendingRequest::register(UnboundedReceiverStream::new(rx), request, Span::none());

        tx.send(custom("noise")).unwrap();
        tx.send(custom("pong")).unwrap();
        let outcome = pending.outcome().await.unwrap();
        assert!(is_named(&outcome.into_packet().unwrap(), "pong"));

        // Well past the deadline: the timer was aborted.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);

        // Later matches are never looked at.
        let _ = tx.send(custom("pong"));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_ignores_late_reply() {
        let (tx, rx) = mpsc::unbounded_channel();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let request = {
            let timeouts = Arc::clone(&timeouts);
            let calls = Arc::clone(&calls);
            AwaitResponse::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
            .with_timeout(Duration::from_millis(100))
            .on_timeout(move || {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pending =
            PendingRequest::register(UnboundedReceiverStream::new(rx), request, Span::none());

        assert_eq!(pending.outcome().await.unwrap(), RequestOutcome::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        let _ = tx.send(custom("late"));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expected_id_filters_before_predicate() {
        let (tx, rx) = mpsc::unbounded_channel();
        let wanted = custom("wanted");
        let calls = Arc::new(AtomicUsize::new(0));

        let request = {
            let calls = Arc::clone(&calls);
            AwaitResponse::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
            .with_id(wanted.id)
        };
        let pending =
            PendingRequest::register(UnboundedReceiverStream::new(rx), request, Span::none());

        tx.send(custom("other")).unwrap();
        tx.send(wanted.clone()).unwrap();
        let outcome = pending.outcome().await.unwrap();
        assert_eq!(outcome, RequestOutcome::Satisfied(wanted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_timeout_callback() {
        let (_tx, rx) = mpsc::unbounded_channel::<Packet>();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let request = {
            let timeouts = Arc::clone(&timeouts);
            AwaitResponse::any()
                .with_timeout(Duration::from_millis(10))
                .on_timeout(move || {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                })
        };
        let pending =
            PendingRequest::register(UnboundedReceiverStream::new(rx), request, Span::none());
        pending.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_suppresses_timeout_callback() {
        let (tx, rx) = mpsc::unbounded_channel();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let request = {
            let timeouts = Arc::clone(&timeouts);
            let calls = Arc::clone(&calls);
            AwaitResponse::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
            .with_timeout(Duration::from_millis(100))
            .on_timeout(move || {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pending =
            PendingRequest::register(UnboundedReceiverStream::new(rx), request, Span::none());

        // The caller gives up first; the request goes with its future.
        let waited = tokio::time::timeout(Duration::from_millis(10), pending.outcome()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);

        let _ = tx.send(custom("late"));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
