//! # Subscription Registry
//!
//! Maps topic destinations to a caller-chosen route value and keeps the broker
//! side in sync. The registry is owned by the session loop, so there is no
//! locking here: every mutation happens on one task.
//!
//! Subscriptions outlive the link. While detached, `subscribe` only records the
//! topic; `attach` replays a SUBSCRIBE for every recorded topic on the new link.

use std::collections::HashMap;

use crate::transport::connection::Publisher;
use crate::transport::frame::{Command, Frame};

/// One recorded subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<R> {
    /// STOMP subscription id, unique for the registry's lifetime.
    pub id: String,
    pub route: R,
    /// True once SUBSCRIBE went out on the current link.
    pub active: bool,
}

pub struct Registry<R: Clone> {
    subscriptions: HashMap<String, Subscription<R>>,
    next_id: u64,
    publisher: Publisher,
}

impl<R: Clone> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone> Registry<R> {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 0,
            publisher: Publisher::detached(),
        }
    }

    /// Subscribes `topic`. Subscribing again only replaces the route; the
    /// broker never sees a second SUBSCRIBE for the same topic.
    ///
    /// Returns `true` when the topic was not subscribed before.
    pub fn subscribe(&mut self, topic: &str, route: R) -> bool {
        if let Some(existing) = self.subscriptions.get_mut(topic) {
            existing.route = route;
            log::debug!("Route replaced for {}", topic);
            return false;
        }

        self.next_id += 1;
        let id = format!("sub-{}", self.next_id);
        let mut active = false;
        if self.publisher.is_live() {
            match self.publisher.send_frame(&Frame::subscribe(&id, topic)) {
                Ok(()) => active = true,
                Err(e) => log::warn!("SUBSCRIBE {} deferred until next attach: {}", topic, e),
            }
        }
        log::info!("Subscribed {} as {}", topic, id);
        self.subscriptions
            .insert(topic.to_string(), Subscription { id, route, active });
        true
    }

    /// Drops `topic`. Unknown topics are ignored.
    pub fn unsubscribe(&mut self, topic: &str) {
        let Some(sub) = self.subscriptions.remove(topic) else {
            return;
        };
        if sub.active {
            if let Err(e) = self.publisher.send_frame(&Frame::unsubscribe(&sub.id)) {
                log::debug!("UNSUBSCRIBE {} not sent: {}", topic, e);
            }
        }
        log::info!("Unsubscribed {}", topic);
    }

    /// Unsubscribes every topic. The link itself stays up.
    pub fn clear_all(&mut self) {
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            self.unsubscribe(&topic);
        }
    }

    /// Forgets every subscription without telling the broker. Used when the
    /// link is about to be closed anyway.
    pub fn release(&mut self) {
        if !self.subscriptions.is_empty() {
            log::info!("Releasing {} subscriptions", self.subscriptions.len());
        }
        self.subscriptions.clear();
        self.publisher = Publisher::detached();
    }

    /// Binds the registry to a fresh link and replays every subscription.
    pub fn attach(&mut self, publisher: Publisher) {
        self.publisher = publisher;
        for (topic, sub) in self.subscriptions.iter_mut() {
            match self.publisher.send_frame(&Frame::subscribe(&sub.id, topic)) {
                Ok(()) => sub.active = true,
                Err(e) => log::warn!("Replaying SUBSCRIBE {} failed: {}", topic, e),
            }
        }
    }

    /// Unbinds the registry from a link that went down.
    pub fn detach(&mut self) {
        self.publisher = Publisher::detached();
        for sub in self.subscriptions.values_mut() {
            sub.active = false;
        }
    }

    /// The route for an inbound MESSAGE. Frames for unknown destinations are
    /// logged and dropped.
    pub fn route(&self, frame: &Frame) -> Option<R> {
        if frame.command != Command::Message {
            log::debug!("Ignoring {} frame", frame.command.as_str());
            return None;
        }
        let Some(destination) = frame.destination() else {
            log::warn!("MESSAGE without destination dropped");
            return None;
        };
        match self.subscriptions.get(destination) {
            Some(sub) => Some(sub.route.clone()),
            None => {
                log::warn!("MESSAGE for unsubscribed {} dropped", destination);
                None
            }
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    pub fn subscription(&self, topic: &str) -> Option<&Subscription<R>> {
        self.subscriptions.get(topic)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
