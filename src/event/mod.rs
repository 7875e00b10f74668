
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::mirror::MirroredTrack;

lazy_static! {
    static ref SUBSCRIPTION_UNIQUE_ID: AtomicUsize = AtomicUsize::new(0);
}

/// Lifecycle transitions a [`MirroredTrack`] publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorEvent {
    /// First consumer attached (attach count 0 -> 1).
    Attached,
    /// Last consumer detached (attach count 1 -> 0).
    Detached,
    /// The mirror was stopped. Terminal; emitted at most once.
    Stopped,
}

impl fmt::Display for MirrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            MirrorEvent::Attached => "attached",
            MirrorEvent::Detached => "detached",
            MirrorEvent::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

pub type OnMirrorEventHdlrFn = Box<
    dyn (FnMut(Arc<MirroredTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync
        + 'static,
>;

struct Subscription {
    id: usize,
    event: MirrorEvent,
    once: bool,
    hdlr: OnMirrorEventHdlrFn,
}

/// EventChannel is a per-instance publish/subscribe list for mirror
/// lifecycle events. Handlers run in subscription order on the emitting
/// task, so delivery happens-after the call that triggered the event.
#[derive(Default)]
pub struct EventChannel {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventChannel {
    pub fn new() -> Self {
        EventChannel {
            subscriptions: Mutex::new(vec![]),
        }
    }

    /// on registers a handler for every occurrence of the event. Returns a
    /// subscription id usable with off().
    pub async fn on<F>(&self, event: MirrorEvent, handler: F) -> usize
    where
        F: FnMut(Arc<MirroredTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>
            + Send
            + Sync
            + 'static,
    {
        self.subscribe(event, false, Box::new(handler)).await
    }

    /// once registers a handler that is removed before its first run.
    pub async fn once<F>(&self, event: MirrorEvent, handler: F) -> usize
    where
        F: FnMut(Arc<MirroredTrack>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>
            + Send
            + Sync
            + 'static,
    {
        self.subscribe(event, true, Box::new(handler)).await
    }

    async fn subscribe(&self, event: MirrorEvent, once: bool, hdlr: OnMirrorEventHdlrFn) -> usize {
        let id = SUBSCRIPTION_UNIQUE_ID.fetch_add(1, Ordering::SeqCst);
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.push(Subscription {
            id,
            event,
            once,
            hdlr,
        });
        id
    }

    /// off removes one subscription; returns false if the id is unknown
    /// (already fired once-handler, or already removed).
    pub async fn off(&self, id: usize) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// clear drops every subscription.
    pub async fn clear(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.clear();
    }

    pub async fn subscription_count(&self) -> usize {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions.len()
    }

    /// emit runs every handler registered for the event, in subscription
    /// order, with the mirror as payload. Once-handlers are removed before
    /// they run. Returns after all handlers complete.
    pub(crate) async fn emit(&self, event: MirrorEvent, track: Arc<MirroredTrack>) {
        // Matching handlers are taken out of the list while they run so a
        // handler can subscribe/unsubscribe without deadlocking the channel.
        let mut fired: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            let mut fired = vec![];
            let mut i = 0;
            while i < subscriptions.len() {
                if subscriptions[i].event == event {
                    fired.push(subscriptions.remove(i));
                } else {
                    i += 1;
                }
            }
            fired
        };

        log::trace!("emit {} to {} subscriber(s)", event, fired.len());

        for sub in &mut fired {
            (sub.hdlr)(Arc::clone(&track)).await;
        }

        // Re-insert the persistent subscriptions, keeping them live for the
        // next emission. Relative order among survivors is preserved.
        let mut subscriptions = self.subscriptions.lock().await;
        for sub in fired {
            if !sub.once {
                subscriptions.push(sub);
            }
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel").finish()
    }
}
