//! Multi-subscriber event stream
//!
//! Producers enqueue events on a bounded inbound channel. A single dispatch
//! task per stream drains it, appends each event to the stream's
//! [`EventLog`] and forwards it to every live [`Subscription`], so all
//! subscribers observe the publish order.
//!
//! A subscription created with a cursor first yields the logged events
//! with `id >= cursor` (snapshotted under the stream lock at creation), then
//! whatever the dispatcher forwards afterwards, unfiltered. Because logging
//! and registration both happen under the same lock, no event is seen twice
//! or skipped at the boundary.

use crate::config::StreamConfig;
use crate::events::{Event, EventLog};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Publishing to a stream that is stopping or stopped
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stream '{0}' is stopped and no longer accepts events")]
pub struct StreamStopped(pub String);

/// Stop flag shared by a subscription and its slot in the stream
#[derive(Debug)]
struct SubscriptionState {
    stopped: AtomicBool,
    acks: Arc<Notify>,
}

impl SubscriptionState {
    fn new(acks: Arc<Notify>) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            acks,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mark_stopped(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.acks.notify_waiters();
        }
    }
}

struct SubscriptionSlot {
    /// `None` once the stream closed this subscription's channel
    sender: Option<mpsc::Sender<Arc<Event>>>,
    state: Arc<SubscriptionState>,
}

#[derive(Default)]
struct StreamState {
    log: EventLog,
    subscriptions: HashMap<u64, SubscriptionSlot>,
    next_subscription_id: u64,
}

fn lock_state(state: &Mutex<StreamState>) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One client's view of an [`EventStream`]
///
/// Holds only the stream id, not the stream itself.
pub struct Subscription {
    id: u64,
    stream_id: String,
    url: String,
    cursor: u64,
    last_event_id: Option<u64>,
    replay: VecDeque<Arc<Event>>,
    receiver: mpsc::Receiver<Arc<Event>>,
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// URL of the client connection that owns this subscription
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cursor the subscription was created with
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Id of the last logged event handed out by [`Subscription::recv`]
    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    pub fn mark_stopped(&self) {
        self.state.mark_stopped();
    }

    /// Close the channel; later fan-out attempts drop this subscription
    pub fn close(&mut self) {
        self.receiver.close();
        self.state.mark_stopped();
    }

    /// Next event: replayed backlog first, then live events
    ///
    /// The cursor only bounds the replayed backlog. Live events are returned
    /// as the dispatcher forwards them, whatever their id. Returns `None`
    /// once the subscription is stopped or its channel has been closed and
    /// drained. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        if self.state.is_stopped() {
            return None;
        }

        let event = match self.replay.pop_front() {
            Some(event) => event,
            None => match self.receiver.recv().await {
                Some(_) if self.state.is_stopped() => return None,
                Some(event) => event,
                None => {
                    self.state.mark_stopped();
                    return None;
                }
            },
        };

        if let Some(id) = event.id() {
            self.last_event_id = Some(id);
        }
        Some(event)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("url", &self.url)
            .field("cursor", &self.cursor)
            .field("last_event_id", &self.last_event_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Broadcaster owning an event log and a set of subscriptions
pub struct EventStream {
    id: String,
    config: StreamConfig,
    inbound: Mutex<Option<mpsc::Sender<Event>>>,
    state: Arc<Mutex<StreamState>>,
    stopping: AtomicBool,
    forced: AtomicBool,
    stop_token: CancellationToken,
    dispatch_done: CancellationToken,
    acks: Arc<Notify>,
}

impl EventStream {
    /// Create the stream and start its dispatch task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(id: impl Into<String>, config: StreamConfig) -> Arc<Self> {
        let id = id.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let state = Arc::new(Mutex::new(StreamState::default()));
        let stop_token = CancellationToken::new();
        let dispatch_done = CancellationToken::new();

        tokio::spawn(run_dispatch(Dispatcher {
            stream_id: id.clone(),
            inbound: inbound_rx,
            state: Arc::clone(&state),
            stop: stop_token.clone(),
            done: dispatch_done.clone(),
            send_timeout: config.subscriber_send_timeout(),
        }));

        debug!(stream = %id, "Event stream created");

        Arc::new(Self {
            id,
            config,
            inbound: Mutex::new(Some(inbound_tx)),
            state,
            stopping: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            stop_token,
            dispatch_done,
            acks: Arc::new(Notify::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// A stop or graceful stop has been requested
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        lock_state(&self.state).subscriptions.len()
    }

    pub fn log_len(&self) -> usize {
        lock_state(&self.state).log.len()
    }

    pub fn clear_log(&self) {
        lock_state(&self.state).log.clear();
    }

    /// Enqueue an event for dispatch, waiting for inbound capacity
    ///
    /// # Panics
    ///
    /// Panics if the stream is stopping or stopped; publishing after a stop
    /// request is a caller bug. Use [`EventStream::try_publish`] when the
    /// stream may be torn down concurrently.
    pub async fn publish(&self, event: Event) {
        if let Err(err) = self.try_publish(event).await {
            panic!("{err}");
        }
    }

    /// Enqueue an event for dispatch, failing if the stream is stopping
    pub async fn try_publish(&self, event: Event) -> Result<(), StreamStopped> {
        if self.is_stopping() {
            return Err(StreamStopped(self.id.clone()));
        }
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| StreamStopped(self.id.clone()))?;

        sender
            .send(event)
            .await
            .map_err(|_| StreamStopped(self.id.clone()))
    }

    /// Register a new subscription starting at `cursor`
    pub fn add_subscription(&self, cursor: u64, url: impl Into<String>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let state = Arc::new(SubscriptionState::new(Arc::clone(&self.acks)));

        let mut stream_state = lock_state(&self.state);
        let replay: VecDeque<Arc<Event>> = stream_state.log.replay(cursor).cloned().collect();
        let id = stream_state.next_subscription_id;
        stream_state.next_subscription_id += 1;

        let sender = if self.is_stopping() {
            state.mark_stopped();
            None
        } else {
            Some(sender)
        };
        stream_state.subscriptions.insert(
            id,
            SubscriptionSlot {
                sender,
                state: Arc::clone(&state),
            },
        );
        drop(stream_state);

        let url = url.into();
        debug!(stream = %self.id, subscription = id, cursor, %url, "Subscription added");

        Subscription {
            id,
            stream_id: self.id.clone(),
            url,
            cursor,
            last_event_id: None,
            replay,
            receiver,
            state,
        }
    }

    /// Unregister a subscription, returning the remaining subscriber count
    pub fn remove_subscription(&self, subscription: &Subscription) -> usize {
        subscription.mark_stopped();
        let mut state = lock_state(&self.state);
        state.subscriptions.remove(&subscription.id);
        let remaining = state.subscriptions.len();
        debug!(stream = %self.id, subscription = subscription.id, remaining, "Subscription removed");
        remaining
    }

    /// Stop immediately without delivering queued events
    ///
    /// Idempotent. Every subscription is marked stopped.
    pub fn stop(&self) {
        if self.forced.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stopping.store(true, Ordering::Release);
        info!(stream = %self.id, "Stopping event stream");

        self.stop_token.cancel();
        self.close_inbound();

        let mut state = lock_state(&self.state);
        for slot in state.subscriptions.values_mut() {
            slot.sender = None;
            slot.state.mark_stopped();
        }
    }

    /// Deliver queued events, then stop every subscription, bounded by `timeout`
    ///
    /// Idempotent. Returns at the deadline even if some subscribers never
    /// acknowledged; callers must not assume everything was flushed.
    pub async fn graceful_stop(&self, timeout: Duration) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(stream = %self.id, ?timeout, "Gracefully stopping event stream");
        let deadline = tokio::time::Instant::now() + timeout;

        // the dispatcher exits once the closed inbound channel is drained
        self.close_inbound();
        if tokio::time::timeout_at(deadline, self.dispatch_done.cancelled())
            .await
            .is_err()
        {
            warn!(stream = %self.id, "Queued events not fully dispatched before deadline");
        }

        {
            let mut state = lock_state(&self.state);
            for slot in state.subscriptions.values_mut() {
                slot.sender = None;
            }
        }

        if tokio::time::timeout_at(deadline, self.wait_for_subscribers())
            .await
            .is_err()
        {
            warn!(
                stream = %self.id,
                remaining = self.pending_subscribers(),
                "Subscribers did not acknowledge stop before deadline"
            );
        }

        self.stop_token.cancel();
    }

    fn close_inbound(&self) {
        drop(
            self.inbound
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
    }

    fn pending_subscribers(&self) -> usize {
        lock_state(&self.state)
            .subscriptions
            .values()
            .filter(|slot| !slot.state.is_stopped())
            .count()
    }

    async fn wait_for_subscribers(&self) {
        loop {
            let notified = self.acks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_subscribers() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

struct Dispatcher {
    stream_id: String,
    inbound: mpsc::Receiver<Event>,
    state: Arc<Mutex<StreamState>>,
    stop: CancellationToken,
    done: CancellationToken,
    send_timeout: Duration,
}

type Target = (u64, mpsc::Sender<Arc<Event>>, Arc<SubscriptionState>);

async fn run_dispatch(dispatcher: Dispatcher) {
    let Dispatcher {
        stream_id,
        mut inbound,
        state,
        stop,
        done,
        send_timeout,
    } = dispatcher;
    let _done = done.drop_guard();

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = inbound.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        let Some((event, targets)) = prepare_fan_out(&state, event) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = fan_out(&stream_id, &state, event, targets, send_timeout) => {}
        }
    }

    debug!(stream = %stream_id, "Dispatch task exited");
}

/// Log the event and snapshot the live subscriptions, under the stream lock
fn prepare_fan_out(state: &Mutex<StreamState>, event: Event) -> Option<(Arc<Event>, Vec<Target>)> {
    let mut state = lock_state(state);

    let event = if event.is_end_of_stream() {
        Arc::new(event)
    } else {
        state.log.add(event)?
    };

    state.subscriptions.retain(|_, slot| !slot.state.is_stopped());
    let targets = state
        .subscriptions
        .iter()
        .filter_map(|(id, slot)| {
            slot.sender
                .as_ref()
                .map(|sender| (*id, sender.clone(), Arc::clone(&slot.state)))
        })
        .collect();

    Some((event, targets))
}

async fn fan_out(
    stream_id: &str,
    state: &Mutex<StreamState>,
    event: Arc<Event>,
    targets: Vec<Target>,
    send_timeout: Duration,
) {
    for (subscription_id, sender, subscription_state) in targets {
        let delivered = match tokio::time::timeout(send_timeout, sender.send(Arc::clone(&event))).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    stream = %stream_id,
                    subscription = subscription_id,
                    ?send_timeout,
                    "Subscriber too slow, dropping it"
                );
                false
            }
        };

        if !delivered {
            subscription_state.mark_stopped();
            if let Some(slot) = lock_state(state).subscriptions.get_mut(&subscription_id) {
                slot.sender = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig {
            subscriber_capacity: 8,
            ..StreamConfig::default()
        }
    }

    async fn next(subscription: &mut Subscription) -> Option<Arc<Event>> {
        tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let stream = EventStream::new("s", config());
        let mut sub = stream.add_subscription(0, "https://localhost/s");
        stream.publish(Event::new("x")).await;

        let event = next(&mut sub).await.unwrap();
        assert_eq!(event.data(), "x");
        assert_eq!(event.id(), Some(0));
        assert_eq!(sub.last_event_id(), Some(0));
    }

    #[tokio::test]
    async fn test_empty_event_dropped() {
        let stream = EventStream::new("s", config());
        let mut sub = stream.add_subscription(0, "u");
        stream.publish(Event::default()).await;
        stream.publish(Event::new("y")).await;

        assert_eq!(next(&mut sub).await.unwrap().data(), "y");
        assert_eq!(stream.log_len(), 1);
    }

    #[tokio::test]
    async fn test_try_publish_after_stop_fails() {
        let stream = EventStream::new("s", config());
        stream.stop();
        let err = stream.try_publish(Event::new("x")).await.unwrap_err();
        assert_eq!(err, StreamStopped("s".to_string()));
    }

    #[tokio::test]
    #[should_panic(expected = "no longer accepts events")]
    async fn test_publish_after_stop_panics() {
        let stream = EventStream::new("s", config());
        stream.stop();
        stream.publish(Event::new("x")).await;
    }

    #[tokio::test]
    async fn test_subscription_added_after_stop_is_stopped() {
        let stream = EventStream::new("s", config());
        stream.stop();
        let mut sub = stream.add_subscription(0, "u");
        assert!(sub.is_stopped());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_log_drops_replay() {
        let stream = EventStream::new("s", config());
        let mut live = stream.add_subscription(0, "live");
        stream.publish(Event::new("a")).await;
        assert_eq!(next(&mut live).await.unwrap().data(), "a");

        stream.clear_log();
        assert_eq!(stream.log_len(), 0);

        let mut late = stream.add_subscription(0, "late");
        stream.publish(Event::new("b")).await;
        let event = next(&mut late).await.unwrap();
        assert_eq!(event.data(), "b");
        assert_eq!(event.id(), Some(0));
    }

    #[tokio::test]
    async fn test_remove_subscription_returns_remaining() {
        let stream = EventStream::new("s", config());
        let a = stream.add_subscription(0, "a");
        let b = stream.add_subscription(0, "b");
        assert_eq!(stream.subscriber_count(), 2);
        assert_eq!(stream.remove_subscription(&a), 1);
        assert!(a.is_stopped());
        assert_eq!(stream.remove_subscription(&b), 0);
    }
}
