/*!
 * Event dispatch for beamline control.
 *
 * All channel and device notifications are delivered by a single dispatcher
 * task. Worker tasks and transport threads post jobs into its queue; the
 * dispatcher runs them one at a time, in the order they were posted, so no two
 * handlers ever run concurrently.
 *
 * Observable entities own a [`Signals`] registry. Handlers are attached by
 * event name with [`Signals::subscribe`] and detached with
 * [`Signals::unsubscribe`]. Async observers can also take a broadcast
 * receiver with [`Signals::watch`].
 */
use std::fmt::{self, Debug};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

/// Maximum number of events that can be buffered for each watcher
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// A unit of work executed on the dispatcher
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Job(Job),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single cooperative event queue.
///
/// Cloning the handle is cheap; every clone feeds the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.sender.is_closed())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the dispatcher task on the current tokio runtime
    pub fn spawn() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::runtime(format!("Dispatcher needs a tokio runtime: {}", e)))?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let pending = Arc::new(AtomicUsize::new(0));
        let outstanding = pending.clone();

        handle.spawn(async move {
            debug!("Dispatcher started");
            while let Some(message) = receiver.recv().await {
                match message {
                    Message::Job(job) => {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Event handler panicked; continuing with next job");
                        }
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Dispatcher stopped");
        });

        Ok(Self { sender, pending })
    }

    /// Queue a job for execution on the dispatcher
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Message::Job(Box::new(job))).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Dispatcher is closed, dropping job");
        }
    }

    /// Wait until the queue is idle, including jobs queued by the jobs
    /// that were pending when this was called
    pub async fn flush(&self) {
        loop {
            let (done, wait) = oneshot::channel();
            if self.sender.send(Message::Flush(done)).is_err() || wait.await.is_err() {
                return;
            }
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }

    /// Whether the dispatcher task is gone
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// An event that can be delivered through [`Signals`]
pub trait Signal: Clone + Debug + Send + Sync + 'static {
    /// The event name handlers subscribe to (e.g. "active", "progress")
    fn name(&self) -> &'static str;
}

/// Identifies a single subscription so it can be removed later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: SubscriptionId,
    name: String,
    handler: Handler<E>,
}

struct SignalsInner<E: Signal> {
    dispatcher: Dispatcher,
    subscribers: Mutex<Vec<Subscriber<E>>>,
    sender: broadcast::Sender<E>,
}

impl<E: Signal> SignalsInner<E> {
    fn deliver(&self, event: &E) {
        let handlers: Vec<Handler<E>> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .iter()
                .filter(|s| s.name == event.name())
                .map(|s| s.handler.clone())
                .collect(),
            Err(_) => {
                error!("Subscriber list poisoned, dropping {} event", event.name());
                return;
            }
        };

        trace!("Delivering {} event to {} handlers", event.name(), handlers.len());
        for handler in handlers {
            handler(event);
        }

        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(event.clone());
        }
    }
}

/// Publish/subscribe registry for one observable entity
pub struct Signals<E: Signal> {
    inner: Arc<SignalsInner<E>>,
}

impl<E: Signal> Clone for Signals<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E: Signal> Debug for Signals<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: Signal> Signals<E> {
    /// Create a registry delivering on the given dispatcher
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SignalsInner {
                dispatcher,
                subscribers: Mutex::new(Vec::new()),
                sender,
            }),
        }
    }

    /// The dispatcher this registry delivers on
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Attach a handler for events with the given name
    pub fn subscribe<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        match self.inner.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Subscriber {
                id,
                name: name.to_string(),
                handler: Arc::new(handler),
            }),
            Err(_) => error!("Subscriber list poisoned, {} not attached", id),
        }
        id
    }

    /// Detach a handler. Returns false if the id was not attached here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.subscribers.lock() {
            Ok(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.id != id);
                subscribers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Queue an event for delivery on the dispatcher
    pub fn emit(&self, event: E) {
        let inner = self.inner.clone();
        self.inner.dispatcher.post(move || inner.deliver(&event));
    }

    /// Deliver an event to handlers and watchers immediately. Only call
    /// from a job already running on the dispatcher.
    pub fn deliver_now(&self, event: E) {
        self.inner.deliver(&event);
    }

    /// Receive every emitted event, in dispatch order
    pub fn watch(&self) -> broadcast::Receiver<E> {
        self.inner.sender.subscribe()
    }

    /// Number of attached handlers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
