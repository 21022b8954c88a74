use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::ParleyError;
use crate::types::StreamIncrement;

struct Feed<T, R> {
    pending: VecDeque<T>,
    outcome: Option<R>,
    sealed: bool,
}

struct Channel<T, R> {
    feed: Mutex<Feed<T, R>>,
    settles: fn(&T) -> Option<R>,
    wake: Notify,
}

/// Buffered event feed shared by every clone of the stream, which also
/// settles to a single outcome.
///
/// Events are handed out in push order. The first event that `settles` maps
/// to an outcome is still delivered, after which the feed is sealed and later
/// pushes are dropped.
pub struct EventStream<T, R> {
    channel: Arc<Channel<T, R>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T, R: Clone> EventStream<T, R> {
    pub fn new(settles: fn(&T) -> Option<R>) -> Self {
        Self {
            channel: Arc::new(Channel {
                feed: Mutex::new(Feed {
                    pending: VecDeque::new(),
                    outcome: None,
                    sealed: false,
                }),
                settles,
                wake: Notify::new(),
            }),
        }
    }

    fn feed(&self) -> MutexGuard<'_, Feed<T, R>> {
        self.channel
            .feed
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn push(&self, event: T) {
        {
            let mut feed = self.feed();
            if feed.sealed {
                return;
            }
            if let Some(outcome) = (self.channel.settles)(&event) {
                feed.outcome = Some(outcome);
                feed.sealed = true;
            }
            feed.pending.push_back(event);
        }
        self.channel.wake.notify_waiters();
    }

    /// Seals the feed without a settling event. No-op once sealed.
    pub fn end(&self, outcome: Option<R>) {
        {
            let mut feed = self.feed();
            if feed.sealed {
                return;
            }
            feed.outcome = outcome;
            feed.sealed = true;
        }
        self.channel.wake.notify_waiters();
    }

    /// Next buffered event; `None` once the feed is sealed and drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            let woken = self.channel.wake.notified();
            {
                let mut feed = self.feed();
                if let Some(event) = feed.pending.pop_front() {
                    return Some(event);
                }
                if feed.sealed {
                    return None;
                }
            }
            woken.await;
        }
    }

    pub async fn result(&self) -> Option<R> {
        loop {
            let woken = self.channel.wake.notified();
            {
                let feed = self.feed();
                if feed.sealed {
                    return feed.outcome.clone();
                }
            }
            woken.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    Increment(StreamIncrement),
    Done,
    Error(ParleyError),
}

fn chat_settles(event: &ChatStreamEvent) -> Option<Result<(), ParleyError>> {
    match event {
        ChatStreamEvent::Done => Some(Ok(())),
        ChatStreamEvent::Error(error) => Some(Err(error.clone())),
        ChatStreamEvent::Increment(_) => None,
    }
}

/// Stream produced by a [`crate::ChatTransport`]: increments followed by a
/// terminal `Done` or `Error`.
#[derive(Clone)]
pub struct ChatEventStream {
    inner: EventStream<ChatStreamEvent, Result<(), ParleyError>>,
}

impl ChatEventStream {
    pub fn new() -> Self {
        Self {
            inner: EventStream::new(chat_settles),
        }
    }

    pub fn push_increment(&self, increment: StreamIncrement) {
        self.inner.push(ChatStreamEvent::Increment(increment));
    }

    pub fn finish(&self) {
        self.inner.push(ChatStreamEvent::Done);
    }

    pub fn fail(&self, error: ParleyError) {
        self.inner.push(ChatStreamEvent::Error(error));
    }

    pub async fn next(&self) -> Option<ChatStreamEvent> {
        self.inner.next().await
    }

    pub async fn result(&self) -> Option<Result<(), ParleyError>> {
        self.inner.result().await
    }
}

impl Default for ChatEventStream {
    fn default() -> Self {
        Self::new()
    }
}
