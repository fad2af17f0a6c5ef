//! Subscription records and handles.

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::MethodError;
use crate::protocol::Message;

pub type ReadyCallback = Box<dyn FnOnce() + Send>;
pub type ErrorCallback = Box<dyn FnOnce(MethodError) + Send>;
pub type StopCallback = Box<dyn FnOnce(Option<MethodError>) + Send>;

/// Optional callbacks for [`Connection::subscribe`].
#[derive(Default)]
pub struct SubscriptionCallbacks {
    /// Called once the subscription's initial data has landed.
    pub on_ready: Option<ReadyCallback>,
    /// Called when the server stops the subscription with an error.
    pub on_error: Option<ErrorCallback>,
    /// Called whenever the subscription ends, with the error if any.
    pub on_stop: Option<StopCallback>,
}

impl SubscriptionCallbacks {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once, when the subscription's initial data is in the stores.
    pub fn on_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(f));
        self
    }

    /// Called if the server refuses or stops the subscription with an error.
    pub fn on_error(mut self, f: impl FnOnce(MethodError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl FnOnce(Option<MethodError>) + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

pub(crate) struct Subscription {
    pub(crate) name: String,
    pub(crate) params: Vec<Value>,
    pub(crate) ready: bool,
    /// Marked for teardown unless re-requested before the next sweep.
    pub(crate) inactive: bool,
    pub(crate) seq: u64,
    pub(crate) ready_callback: Option<ReadyCallback>,
    pub(crate) error_callback: Option<ErrorCallback>,
    pub(crate) stop_callback: Option<StopCallback>,
    ready_tx: watch::Sender<bool>,
}

/// Caller-side view of a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    ready: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    /// Subscription id, as sent in `sub`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the subscription is ready right now.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the subscription is ready. Returns false if it ended
    /// first.
    pub async fn ready(&mut self) -> bool {
        self.ready.wait_for(|ready| *ready).await.is_ok()
    }
}

impl Connection {
    /// Subscribe to a publication. An inactive subscription with the same
    /// name and params is reused instead of sending a new `sub`.
    pub fn subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        let existing = self
            .subscriptions
            .iter_mut()
            .find(|(_, sub)| sub.inactive && sub.name == name && sub.params == params);

        if let Some((id, sub)) = existing {
            log::debug!("Reusing inactive subscription '{name}' ({id})");
            sub.inactive = false;

            if let Some(on_ready) = callbacks.on_ready {
                if sub.ready {
                    on_ready();
                } else {
                    sub.ready_callback = Some(on_ready);
                }
            }
            if callbacks.on_error.is_some() {
                sub.error_callback = callbacks.on_error;
            }
            if callbacks.on_stop.is_some() {
                sub.stop_callback = callbacks.on_stop;
            }
            return SubscriptionHandle {
                id: id.clone(),
                ready: sub.ready_tx.subscribe(),
            };
        }

        let id = Uuid::new_v4().simple().to_string();
        let (ready_tx, ready_rx) = watch::channel(false);
        self.next_subscription_seq += 1;
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                name: name.to_string(),
                params: params.clone(),
                ready: false,
                inactive: false,
                seq: self.next_subscription_seq,
                ready_callback: callbacks.on_ready,
                error_callback: callbacks.on_error,
                stop_callback: callbacks.on_stop,
                ready_tx,
            },
        );
        self.send(&Message::sub(id.clone(), name, params));

        SubscriptionHandle {
            id,
            ready: ready_rx,
        }
    }

    /// Stop a subscription: send `unsub` and fire its stop callback.
    pub fn unsubscribe(&mut self, id: &str) {
        let Some(mut sub) = self.remove_subscription(id) else {
            return;
        };
        self.send(&Message::unsub(id));
        if let Some(on_stop) = sub.stop_callback.take() {
            on_stop(None);
        }
    }

    /// Stop every subscription, oldest first.
    pub fn unsubscribe_all(&mut self) {
        let mut ids: Vec<(u64, String)> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| (sub.seq, id.clone()))
            .collect();
        ids.sort();
        for (_, id) in ids {
            self.unsubscribe(&id);
        }
    }

    /// Whether subscription `id` exists and is ready.
    pub fn subscription_ready(&self, id: &str) -> bool {
        self.subscriptions.get(id).is_some_and(|sub| sub.ready)
    }

    /// Live subscriptions, inactive ones included.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Mark for teardown by the next
    /// [`stop_inactive_subscriptions`](Self::stop_inactive_subscriptions).
    pub fn deactivate_subscription(&mut self, id: &str) {
        if let Some(sub) = self.subscriptions.get_mut(id) {
            sub.inactive = true;
        }
    }

    /// Stop every subscription marked inactive.
    pub fn stop_inactive_subscriptions(&mut self) {
        let inactive: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.inactive)
            .map(|(id, _)| id.clone())
            .collect();
        for id in inactive {
            self.unsubscribe(&id);
        }
    }

    pub(crate) fn mark_subscription_ready(&mut self, id: &str) {
        // Stopped before its ready flushed.
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };
        if sub.ready {
            return;
        }
        sub.ready = true;
        sub.ready_tx.send_replace(true);
        if let Some(on_ready) = sub.ready_callback.take() {
            on_ready();
        }
    }

    pub(crate) fn remove_subscription(&mut self, id: &str) -> Option<Subscription> {
        let sub = self.subscriptions.remove(id)?;
        if sub.ready {
            sub.ready_tx.send_replace(false);
        }
        Some(sub)
    }

    /// Re-send every live `sub` in creation order, after a reconnect.
    pub(crate) fn resend_subscriptions(&mut self) {
        let mut subs: Vec<(u64, Message)> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| (sub.seq, Message::sub(id.clone(), sub.name.clone(), sub.params.clone())))
            .collect();
        subs.sort_by_key(|(seq, _)| *seq);
        for (_, msg) in subs {
            self.send(&msg);
        }
    }
}
