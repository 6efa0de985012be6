//! Fan-out router: topic-keyed broadcast channels with scoped subscriptions.
//!
//! The hub holds no durable state. Each topic is a bounded broadcast ring, so
//! a slow subscriber falls behind and loses its oldest events instead of
//! holding up the publisher or anyone else. A subscriber that lagged is told
//! to refetch.
//!
//! A chat subscription taken for a member ends when that member's
//! `MemberLeft` event comes through, so nothing published after the leave
//! reaches them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::{Event, Topic};

pub struct Hub {
    topics: DashMap<Topic, broadcast::Sender<Event>>,
    capacity: usize,
}

/// What a subscription yields.
#[derive(Debug)]
pub enum Delivery {
    Event(Event),
    /// `n` events were dropped; the subscriber must refetch.
    Lagged(u64),
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register interest in `topic` until the returned handle is dropped.
    pub fn subscribe(self: &Arc<Self>, topic: Topic) -> Subscription {
        self.subscribe_inner(topic, None)
    }

    /// Like `subscribe`, but the subscription also ends once `user_id`
    /// leaves the chat behind `topic`.
    pub fn subscribe_member(self: &Arc<Self>, topic: Topic, user_id: &str) -> Subscription {
        self.subscribe_inner(topic, Some(user_id.to_string()))
    }

    fn subscribe_inner(self: &Arc<Self>, topic: Topic, member: Option<String>) -> Subscription {
        let receiver = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!("Subscribed to {}", topic);

        Subscription {
            hub: Arc::clone(self),
            topic,
            member,
            receiver: Some(receiver),
        }
    }

    /// Deliver to every current subscriber of `topic`. Returns how many there were.
    ///
    /// Callers publish only after the mutation behind `event` is durable.
    pub fn publish(&self, topic: &Topic, event: Event) -> usize {
        let Some(sender) = self.topics.get(topic) else {
            return 0;
        };

        let kind = event.kind();
        match sender.send(event) {
            Ok(receivers) => {
                tracing::debug!("Published {} to {} ({} subscribers)", kind, topic, receivers);
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn publish_to_users<'a>(&self, user_ids: impl IntoIterator<Item = &'a String>, event: &Event) {
        for user_id in user_ids {
            self.publish(&Topic::user(user_id.as_str()), event.clone());
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn release(&self, topic: &Topic) {
        // Holding the shard lock makes this atomic against a concurrent subscribe.
        if self
            .topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            tracing::debug!("Topic {} has no subscribers left", topic);
        }
    }
}

/// Live registration on one topic. Dropping it unsubscribes, on every exit path.
pub struct Subscription {
    hub: Arc<Hub>,
    topic: Topic,
    member: Option<String>,
    receiver: Option<broadcast::Receiver<Event>>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next delivery, or `None` once the topic is gone or the member left.
    ///
    /// The member's own `MemberLeft` event is still delivered; the call after
    /// it returns `None`.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => {
                if self.is_revoked_by(&event) {
                    tracing::debug!("Subscription on {} revoked", self.topic);
                    drop(self.receiver.take());
                    self.hub.release(&self.topic);
                }
                Some(Delivery::Event(event))
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Subscriber on {} lagged, skipped {} events", self.topic, skipped);
                Some(Delivery::Lagged(skipped))
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// The user this subscription was taken for, if any.
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    fn is_revoked_by(&self, event: &Event) -> bool {
        match (event, &self.member) {
            (Event::MemberLeft { user_id, .. }, Some(member)) => user_id == member,
            _ => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before the count is checked.
        drop(self.receiver.take());
        self.hub.release(&self.topic);
    }
}
