//! Watch events.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Kind of change a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// Session-level change, e.g. leadership expired.
    Session,
    /// The watch was dropped by the coordination service without firing.
    NotWatching,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub path: String,
}

impl Event {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// One-shot watch registration.
///
/// Resolves exactly once, with the event that fired it or with
/// [`EventKind::NotWatching`] if the registration was dropped. It must be
/// re-registered after it resolves and must not be polled again.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<Event>,
}

impl Watch {
    /// Creates a watch and the sender that fires it.
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<Event>, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Watch {
                path: path.into(),
                rx,
            },
        )
    }

    /// Path this watch was registered on.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for Watch {
    type Output = Event;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Event::new(EventKind::NotWatching, self.path.clone()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
