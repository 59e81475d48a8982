//! In-process pub/sub broker.
//!
//! Each topic keeps an append-only log. Subscriptions hold their own backlog,
//! seeded from the log (`Earliest`) or empty (`Latest`), and track delivered
//! but unacknowledged messages per consumer so the prefetch window can be
//! enforced and unacknowledged work can be redelivered on unsubscribe.
//!
//! Only the most recent acknowledgements are remembered for duplicate
//! detection; an ack repeated after its id has aged out of that history is
//! reported as [`BrokerError::UnknownMessage`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use courier_core::{Message, MessageId, Properties};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::subscription::{InitialPosition, SubscriptionMode, SubscriptionOptions};
use crate::traits::{MessageConsumer, MessageSender};

/// Acknowledged ids remembered per subscription.
pub const DEFAULT_ACK_HISTORY: usize = 1024;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    topics: DashMap<String, Arc<Mutex<TopicState>>>,
    next_consumer_id: AtomicU64,
    offline: AtomicBool,
    ack_history: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_ack_history(DEFAULT_ACK_HISTORY)
    }
}

#[derive(Default)]
struct TopicState {
    log: Vec<Message>,
    subscriptions: HashMap<String, SubscriptionState>,
}

struct SubscriptionState {
    mode: SubscriptionMode,
    backlog: VecDeque<Message>,
    in_flight: HashMap<MessageId, InFlight>,
    acknowledged: AckHistory,
    consumers: HashSet<u64>,
    delivered: u64,
    notify: Arc<Notify>,
}

struct InFlight {
    owner: u64,
    seq: u64,
    message: Message,
}

/// Total acknowledgements plus a bounded window of recent ids.
struct AckHistory {
    total: usize,
    capacity: usize,
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl AckHistory {
    fn new(capacity: usize) -> Self {
        Self {
            total: 0,
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn insert(&mut self, id: MessageId) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.order.len()
    }
}

impl SubscriptionState {
    fn new(mode: SubscriptionMode, backlog: VecDeque<Message>, ack_history: usize) -> Self {
        Self {
            mode,
            backlog,
            in_flight: HashMap::new(),
            acknowledged: AckHistory::new(ack_history),
            consumers: HashSet::new(),
            delivered: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn in_flight_for(&self, consumer_id: u64) -> usize {
        self.in_flight
            .values()
            .filter(|entry| entry.owner == consumer_id)
            .count()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker remembering the last `capacity` acknowledged ids per
    /// subscription for duplicate detection.
    pub fn with_ack_history(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: DashMap::new(),
                next_consumer_id: AtomicU64::new(0),
                offline: AtomicBool::new(false),
                ack_history: capacity,
            }),
        }
    }

    fn topic_state(&self, topic: &str) -> Arc<Mutex<TopicState>> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    /// Attach a consumer to `options.subscription`, creating the subscription
    /// on first use.
    pub fn subscribe(&self, options: SubscriptionOptions) -> Result<MemoryConsumer> {
        options.validate()?;

        let state = self.topic_state(&options.topic);
        let consumer_id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let ack_history = self.inner.ack_history;

        let notify = {
            let mut guard = state.lock();
            let topic = &mut *guard;

            let subscription = topic
                .subscriptions
                .entry(options.subscription.clone())
                .or_insert_with(|| {
                    let backlog = match options.initial_position {
                        InitialPosition::Earliest => topic.log.iter().cloned().collect(),
                        InitialPosition::Latest => VecDeque::new(),
                    };
                    SubscriptionState::new(options.mode, backlog, ack_history)
                });

            if subscription.mode != options.mode {
                return Err(BrokerError::ModeMismatch {
                    subscription: options.subscription.clone(),
                    existing: subscription.mode,
                });
            }
            if subscription.mode == SubscriptionMode::Exclusive
                && !subscription.consumers.is_empty()
            {
                return Err(BrokerError::ConsumerBusy {
                    topic: options.topic.clone(),
                    subscription: options.subscription.clone(),
                });
            }

            subscription.consumers.insert(consumer_id);
            subscription.notify.clone()
        };

        info!(
            topic = %options.topic,
            subscription = %options.subscription,
            mode = %options.mode,
            prefetch = options.prefetch,
            consumer_id,
            "Consumer subscribed"
        );

        Ok(MemoryConsumer {
            broker: self.clone(),
            topic: state,
            topic_name: options.topic,
            subscription: options.subscription,
            consumer_id,
            prefetch: options.prefetch,
            notify,
            closed: AtomicBool::new(false),
        })
    }

    /// Everything ever published to `topic`, in publish order.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.inner
            .topics
            .get(topic)
            .map(|state| state.lock().log.clone())
            .unwrap_or_default()
    }

    pub fn acknowledged_count(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| s.acknowledged.total)
    }

    /// Messages not yet acknowledged: waiting in the backlog or in flight.
    pub fn unacknowledged_count(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| {
            s.backlog.len() + s.in_flight.len()
        })
    }

    fn with_subscription<T: Default>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&SubscriptionState) -> T,
    ) -> T {
        self.inner
            .topics
            .get(topic)
            .and_then(|state| state.lock().subscriptions.get(subscription).map(f))
            .unwrap_or_default()
    }

    /// Simulate an outage: every call fails with `Disconnected` and waiting
    /// consumers are woken so they observe it.
    pub fn disconnect(&self) {
        warn!("Memory broker going offline");
        self.inner.offline.store(true, Ordering::Release);
        self.wake_all();
    }

    pub fn reconnect(&self) {
        info!("Memory broker back online");
        self.inner.offline.store(false, Ordering::Release);
        self.wake_all();
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.offline.load(Ordering::Acquire)
    }

    fn wake_all(&self) {
        let notifies: Vec<Arc<Notify>> = self
            .inner
            .topics
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .lock()
                    .subscriptions
                    .values()
                    .map(|s| s.notify.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        for notify in notifies {
            notify.notify_waiters();
        }
    }
}

#[async_trait]
impl MessageSender for MemoryBroker {
    #[instrument(skip(self, payload, properties), fields(payload_len = payload.len()))]
    async fn send(&self, topic: &str, payload: Bytes, properties: Properties) -> Result<MessageId> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        if topic.is_empty() {
            return Err(BrokerError::Other("topic cannot be empty".to_string()));
        }

        let id = MessageId::new(Uuid::now_v7().to_string());
        let message = Message {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
            properties,
            redelivery_count: 0,
            publish_time: Utc::now(),
        };

        let state = self.topic_state(topic);
        let notifies: Vec<Arc<Notify>> = {
            let mut topic_state = state.lock();
            topic_state.log.push(message.clone());
            topic_state
                .subscriptions
                .values_mut()
                .map(|subscription| {
                    subscription.backlog.push_back(message.clone());
                    subscription.notify.clone()
                })
                .collect()
        };

        for notify in notifies {
            notify.notify_waiters();
        }

        debug!(message_id = %id, "Message published");
        Ok(id)
    }
}

/// A consumer attached to one subscription of a [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: Arc<Mutex<TopicState>>,
    topic_name: String,
    subscription: String,
    consumer_id: u64,
    prefetch: usize,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    pub fn topic(&self) -> &str {
        &self.topic_name
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    fn try_take(&self) -> Option<Message> {
        let mut guard = self.topic.lock();
        let subscription = guard.subscriptions.get_mut(&self.subscription)?;

        if subscription.in_flight_for(self.consumer_id) >= self.prefetch {
            return None;
        }

        let message = subscription.backlog.pop_front()?;
        subscription.delivered += 1;
        let seq = subscription.delivered;
        subscription.in_flight.insert(
            message.id.clone(),
            InFlight {
                owner: self.consumer_id,
                seq,
                message: message.clone(),
            },
        );
        Some(message)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if !self.broker.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&self) -> Result<Message> {
        loop {
            // Register for wakeups before checking so a publish racing with
            // the check is not missed.
            let notified = self.notify.notified();

            self.ensure_open()?;
            if let Some(message) = self.try_take() {
                return Ok(message);
            }

            notified.await;
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.ensure_open()?;

        {
            let mut guard = self.topic.lock();
            let subscription = guard
                .subscriptions
                .get_mut(&self.subscription)
                .ok_or(BrokerError::Closed)?;

            match subscription.in_flight.remove(&message.id) {
                Some(entry) if entry.owner == self.consumer_id => {
                    subscription.acknowledged.insert(message.id.clone());
                }
                Some(entry) => {
                    subscription.in_flight.insert(message.id.clone(), entry);
                    return Err(BrokerError::UnknownMessage(message.id.clone()));
                }
                None if subscription.acknowledged.contains(&message.id) => {
                    return Err(BrokerError::AlreadyAcknowledged(message.id.clone()));
                }
                None => return Err(BrokerError::UnknownMessage(message.id.clone())),
            }
        }

        // A prefetch slot was freed.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let requeued = {
            let mut guard = self.topic.lock();
            let Some(subscription) = guard.subscriptions.get_mut(&self.subscription) else {
                return Ok(());
            };
            subscription.consumers.remove(&self.consumer_id);

            let mut mine: Vec<MessageId> = subscription
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.owner == self.consumer_id)
                .map(|(id, _)| id.clone())
                .collect();
            let mut entries: Vec<InFlight> = mine
                .drain(..)
                .filter_map(|id| subscription.in_flight.remove(&id))
                .collect();
            entries.sort_by_key(|entry| entry.seq);

            let count = entries.len();
            for entry in entries.into_iter().rev() {
                let mut message = entry.message;
                message.redelivery_count += 1;
                subscription.backlog.push_front(message);
            }
            count
        };

        self.notify.notify_waiters();

        info!(
            topic = %self.topic_name,
            subscription = %self.subscription,
            consumer_id = self.consumer_id,
            requeued,
            "Consumer unsubscribed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn publish(broker: &MemoryBroker, topic: &str, body: &'static str) -> MessageId {
        broker
            .send(topic, Bytes::from_static(body.as_bytes()), Properties::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_earliest_sees_history_latest_does_not() {
        let broker = MemoryBroker::new();
        publish(&broker, "t", "before").await;

        let earliest = broker
            .subscribe(SubscriptionOptions::new("t", "early"))
            .unwrap();
        let latest = broker
            .subscribe(
                SubscriptionOptions::new("t", "late").initial_position(InitialPosition::Latest),
            )
            .unwrap();

        publish(&broker, "t", "after").await;

        assert_eq!(earliest.receive().await.unwrap().payload, "before");
        assert_eq!(earliest.receive().await.unwrap().payload, "after");
        assert_eq!(latest.receive().await.unwrap().payload, "after");
    }

    #[tokio::test]
    async fn test_exclusive_rejects_second_consumer_until_released() {
        let broker = MemoryBroker::new();
        let options = SubscriptionOptions::new("t", "sub").mode(SubscriptionMode::Exclusive);

        let first = broker.subscribe(options.clone()).unwrap();
        assert!(matches!(
            broker.subscribe(options.clone()),
            Err(BrokerError::ConsumerBusy { .. })
        ));

        first.unsubscribe().await.unwrap();
        assert!(broker.subscribe(options).is_ok());
    }

    #[tokio::test]
    async fn test_mode_mismatch() {
        let broker = MemoryBroker::new();
        let _shared = broker
            .subscribe(SubscriptionOptions::new("t", "sub"))
            .unwrap();
        let result = broker
            .subscribe(SubscriptionOptions::new("t", "sub").mode(SubscriptionMode::Exclusive));
        assert!(matches!(result, Err(BrokerError::ModeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_shared_subscription_delivers_each_message_once() {
        let broker = MemoryBroker::new();
        let a = broker
            .subscribe(SubscriptionOptions::new("t", "sub").prefetch(1))
            .unwrap();
        let b = broker
            .subscribe(SubscriptionOptions::new("t", "sub").prefetch(1))
            .unwrap();

        let first = publish(&broker, "t", "one").await;
        let second = publish(&broker, "t", "two").await;

        // `a` holds one unacked message, so the next one goes to `b`.
        let got_a = a.receive().await.unwrap();
        let got_b = b.receive().await.unwrap();
        assert_eq!(got_a.id, first);
        assert_eq!(got_b.id, second);

        a.acknowledge(&got_a).await.unwrap();
        b.acknowledge(&got_b).await.unwrap();
        assert_eq!(broker.acknowledged_count("t", "sub"), 2);
        assert_eq!(broker.unacknowledged_count("t", "sub"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_window_blocks_until_ack() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(SubscriptionOptions::new("t", "sub").prefetch(1))
            .unwrap();
        publish(&broker, "t", "one").await;
        publish(&broker, "t", "two").await;

        let first = consumer.receive().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_secs(1), consumer.receive()).await;
        assert!(blocked.is_err(), "prefetch window should be full");

        consumer.acknowledge(&first).await.unwrap();
        let second = consumer.receive().await.unwrap();
        assert_eq!(second.payload, "two");
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(SubscriptionOptions::new("t", "sub"))
            .unwrap();

        let waiter = tokio::spawn(async move { consumer.receive().await });
        tokio::task::yield_now().await;
        publish(&broker, "t", "hello").await;

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.payload, "hello");
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(SubscriptionOptions::new("t", "sub"))
            .unwrap();
        publish(&broker, "t", "x").await;

        let message = consumer.receive().await.unwrap();
        consumer.acknowledge(&message).await.unwrap();
        assert!(matches!(
            consumer.acknowledge(&message).await,
            Err(BrokerError::AlreadyAcknowledged(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_history_is_bounded() {
        let broker = MemoryBroker::with_ack_history(2);
        let consumer = broker
            .subscribe(SubscriptionOptions::new("t", "sub"))
            .unwrap();
        for body in ["one", "two", "three"] {
            publish(&broker, "t", body).await;
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            let message = consumer.receive().await.unwrap();
            consumer.acknowledge(&message).await.unwrap();
            received.push(message);
        }

        assert_eq!(broker.acknowledged_count("t", "sub"), 3);
        assert_eq!(
            broker.with_subscription("t", "sub", |s| s.acknowledged.remembered()),
            2
        );
        assert!(matches!(
            consumer.acknowledge(&received[2]).await,
            Err(BrokerError::AlreadyAcknowledged(_))
        ));
        assert!(matches!(
            consumer.acknowledge(&received[0]).await,
            Err(BrokerError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_redelivers_unacked_in_order() {
        let broker = MemoryBroker::new();
        let options = SubscriptionOptions::new("t", "sub").prefetch(10);
        let first = broker.subscribe(options.clone()).unwrap();
        publish(&broker, "t", "one").await;
        publish(&broker, "t", "two").await;

        first.receive().await.unwrap();
        first.receive().await.unwrap();
        first.unsubscribe().await.unwrap();
        assert!(matches!(first.receive().await, Err(BrokerError::Closed)));

        let second = broker.subscribe(options).unwrap();
        let redelivered = second.receive().await.unwrap();
        assert_eq!(redelivered.payload, "one");
        assert_eq!(redelivered.redelivery_count, 1);
        assert_eq!(second.receive().await.unwrap().payload, "two");
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls_and_wakes_waiters() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(SubscriptionOptions::new("t", "sub"))
            .unwrap();

        let waiter = tokio::spawn(async move { consumer.receive().await });
        tokio::task::yield_now().await;
        broker.disconnect();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(BrokerError::Disconnected)
        ));
        let sent = broker.send("t", Bytes::new(), Properties::new()).await;
        assert!(matches!(sent, Err(BrokerError::Disconnected)));

        broker.reconnect();
        assert!(broker.send("t", Bytes::new(), Properties::new()).await.is_ok());
    }
}
