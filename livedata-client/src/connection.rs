//! The connection orchestrator.
//!
//! [`Connection`] owns every piece of client-side protocol state and is driven
//! from a single task: transport events go in through
//! [`handle_event`](Connection::handle_event), timers through
//! [`handle_timers`](Connection::handle_timers), and API calls through
//! `&mut self` methods. Nothing in here blocks or awaits.
//!
//! ```text
//!  transport ──► stream router ──► document reconciler ──┐
//!                     │                                  ▼
//!                     └──► method pipeline        quiescence buffer
//!                                                        │
//!                                          buffered writes ──► stores
//! ```
//!
//! The handlers are split across modules by concern: `stream` (routing and
//! reset), `documents` (server-doc shadow state), `methods` (method blocks
//! and invokers), `subscription` (sub records). This file keeps the shared
//! state, the quiescence buffer and the write-flush policy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::time::Instant;

use tokio::sync::watch;

use crate::config::ConnectionOptions;
use crate::documents::{AfterUpdate, FlushBarriers, ServerDoc, WrittenDoc};
use crate::error::{DdpError, Result};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::methods::{MethodBlock, MethodInvoker, StubFn};
use crate::protocol::Message;
use crate::store::{Store, StoreUpdate};
use crate::subscription::Subscription;
use crate::transport::{ConnectionStatus, DisconnectOptions, Transport, TransportEvent};

pub type ReconnectHook = Box<dyn FnMut(&mut Connection) + Send>;
pub type ConnectedHook = Box<dyn FnMut() + Send>;
pub type NegotiationFailureHook = Box<dyn FnMut(&str) + Send>;
pub type MigrationRetry = Box<dyn FnOnce() + Send>;

/// Client side of a DDP session.
pub struct Connection {
    pub(crate) options: ConnectionOptions,
    pub(crate) transport: Box<dyn Transport>,

    pub(crate) last_session_id: Option<String>,
    pub(crate) version_suggestion: Option<String>,
    pub(crate) negotiated_version: Option<String>,

    pub(crate) stores: HashMap<String, Box<dyn Store>>,
    pub(crate) method_handlers: HashMap<String, StubFn>,
    pub(crate) next_method_id: u64,

    /// Methods whose user callback has not fired yet.
    pub(crate) method_invokers: HashMap<String, MethodInvoker>,
    /// The front block is in flight; later blocks wait for it to drain.
    pub(crate) outstanding_method_blocks: VecDeque<MethodBlock>,

    /// method id → documents its stub wrote, until its `updated` arrives.
    pub(crate) documents_written_by_stub: HashMap<String, Vec<WrittenDoc>>,
    /// collection → id → server-truth shadow of a stub-written document.
    pub(crate) server_documents: HashMap<String, HashMap<String, ServerDoc>>,
    pub(crate) flush_barriers: FlushBarriers,
    /// Run after the next store write, in order.
    pub(crate) after_update_callbacks: Vec<AfterUpdate>,

    pub(crate) subscriptions: HashMap<String, Subscription>,
    pub(crate) next_subscription_seq: u64,

    pub(crate) subs_being_revived: HashSet<String>,
    pub(crate) methods_blocking_quiescence: HashSet<String>,
    pub(crate) messages_buffered_until_quiescence: Vec<Message>,
    /// The next store write must reset every store first.
    pub(crate) reset_stores: bool,

    pub(crate) updates_for_unknown_stores: HashMap<String, Vec<StoreUpdate>>,
    pub(crate) buffered_writes: HashMap<String, Vec<StoreUpdate>>,
    /// Hard ceiling for the current batch.
    pub(crate) buffered_writes_flush_at: Option<Instant>,
    /// Inter-write gap timer.
    pub(crate) buffered_writes_flush_timer: Option<Instant>,

    pub(crate) heartbeat: Option<Heartbeat>,
    pub(crate) user_id: watch::Sender<Option<String>>,

    pub(crate) reconnect_hooks: Vec<ReconnectHook>,
    pub(crate) connected_hook: Option<ConnectedHook>,
    pub(crate) negotiation_failure_hook: Option<NegotiationFailureHook>,
    pub(crate) retry_migrate: Option<MigrationRetry>,
}

/// Read-only view of one method block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub wait: bool,
    pub methods: Vec<String>,
}

impl Connection {
    /// Wrap `transport` in a new connection. Nothing is sent until the
    /// transport reports a reset.
    pub fn new(transport: Box<dyn Transport>, options: ConnectionOptions) -> Self {
        let (user_id, _) = watch::channel(None);
        Self {
            options,
            transport,
            last_session_id: None,
            version_suggestion: None,
            negotiated_version: None,
            stores: HashMap::new(),
            method_handlers: HashMap::new(),
            next_method_id: 1,
            method_invokers: HashMap::new(),
            outstanding_method_blocks: VecDeque::new(),
            documents_written_by_stub: HashMap::new(),
            server_documents: HashMap::new(),
            flush_barriers: FlushBarriers::default(),
            after_update_callbacks: Vec::new(),
            subscriptions: HashMap::new(),
            next_subscription_seq: 0,
            subs_being_revived: HashSet::new(),
            methods_blocking_quiescence: HashSet::new(),
            messages_buffered_until_quiescence: Vec::new(),
            reset_stores: false,
            updates_for_unknown_stores: HashMap::new(),
            buffered_writes: HashMap::new(),
            buffered_writes_flush_at: None,
            buffered_writes_flush_timer: None,
            heartbeat: None,
            user_id,
            reconnect_hooks: Vec::new(),
            connected_hook: None,
            negotiation_failure_hook: None,
            retry_migrate: None,
        }
    }

    /// The options this connection was built with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    /// Attach the cache store for `name`. Updates that arrived for the
    /// collection before it was registered are replayed as one batch.
    pub fn register_store(&mut self, name: impl Into<String>, store: Box<dyn Store>) -> Result<()> {
        let name = name.into();
        if self.stores.contains_key(&name) {
            return Err(DdpError::DuplicateStore(name));
        }

        let mut store = store;
        if let Some(queued) = self.updates_for_unknown_stores.remove(&name) {
            log::debug!("Replaying {} queued updates for '{name}'", queued.len());
            store.begin_update(queued.len(), false);
            for update in queued {
                store.update(update);
            }
            store.end_update();
        }

        self.stores.insert(name, store);
        Ok(())
    }

    /// Run `hook` on every reconnect, before outstanding methods are resent.
    /// Methods it calls are queued ahead of them.
    pub fn on_reconnect(&mut self, hook: impl FnMut(&mut Connection) + Send + 'static) {
        self.reconnect_hooks.push(Box::new(hook));
    }

    /// Run `hook` each time the server accepts a session.
    pub fn on_connected(&mut self, hook: impl FnMut() + Send + 'static) {
        self.connected_hook = Some(Box::new(hook));
    }

    /// Run `hook` with the reason when no common protocol version exists.
    pub fn on_version_negotiation_failure(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.negotiation_failure_hook = Some(Box::new(hook));
    }

    // ---------------------------------------------------------------
    // Event entry points
    // ---------------------------------------------------------------

    /// Feed one transport event into the connection.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Message(raw) => self.on_message(&raw),
            TransportEvent::Reset => self.on_reset(),
            TransportEvent::Disconnect => {
                self.on_disconnect();
                Ok(())
            }
        }
    }

    /// Earliest instant at which [`handle_timers`](Self::handle_timers) has
    /// work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = self.heartbeat.as_ref().and_then(Heartbeat::next_deadline);
        match (self.buffered_writes_flush_timer, heartbeat) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timers(&mut self, now: Instant) -> Result<()> {
        if self.buffered_writes_flush_timer.is_some_and(|at| at <= now) {
            self.flush_buffered_writes()?;
        }

        let action = self.heartbeat.as_mut().and_then(|hb| hb.poll(now));
        match action {
            Some(HeartbeatAction::SendPing) => self.send(&Message::ping(None)),
            Some(HeartbeatAction::TimedOut) => {
                log::warn!("DDP heartbeat timed out");
                self.lost_connection();
            }
            None => {}
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Session establishment
    // ---------------------------------------------------------------

    pub(crate) fn livedata_connected(&mut self, session: Option<String>) -> Result<()> {
        let interval = self.options.heartbeat_interval();
        if self.negotiated_version.as_deref() != Some("pre1") && !interval.is_zero() {
            let mut heartbeat = Heartbeat::new(interval, self.options.heartbeat_timeout());
            heartbeat.start(Instant::now());
            self.heartbeat = Some(heartbeat);
        }

        let had_session = self.last_session_id.is_some();
        let mut reconnected_to_previous_session = false;
        if let Some(session) = session {
            reconnected_to_previous_session = self.last_session_id.as_deref() == Some(&session);
            self.last_session_id = Some(session);
        }

        if reconnected_to_previous_session {
            log::debug!("Resumed DDP session");
            return Ok(());
        }

        // The server no longer has our data; everything gets re-synced.
        if had_session {
            self.reset_stores = true;
        }
        self.updates_for_unknown_stores.clear();

        if self.reset_stores {
            self.documents_written_by_stub.clear();
            self.server_documents.clear();
            self.flush_barriers.clear();
            self.buffered_writes.clear();
            self.buffered_writes_flush_timer = None;
            self.buffered_writes_flush_at = None;
        }
        self.after_update_callbacks.clear();

        self.subs_being_revived = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.ready)
            .map(|(id, _)| id.clone())
            .collect();

        // Methods sent before this connection don't block; wait methods sent
        // on it are re-added below.
        self.methods_blocking_quiescence.clear();
        if self.reset_stores {
            for (id, invoker) in &self.method_invokers {
                if invoker.got_result() {
                    // Result arrived on the old connection but its data never
                    // became visible; full quiescence is the closest we get.
                    self.after_update_callbacks.push(AfterUpdate::DataVisible(id.clone()));
                } else if invoker.sent_message {
                    self.methods_blocking_quiescence.insert(id.clone());
                }
            }
        }

        self.messages_buffered_until_quiescence.clear();

        if !self.waiting_for_quiescence() {
            if self.reset_stores {
                for store in self.stores.values_mut() {
                    store.begin_update(0, true);
                    store.end_update();
                }
                self.reset_stores = false;
            }
            self.run_after_update_callbacks()?;
        } else {
            log::debug!(
                "Buffering until {} subs and {} methods settle",
                self.subs_being_revived.len(),
                self.methods_blocking_quiescence.len()
            );
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Quiescence buffer
    // ---------------------------------------------------------------

    /// True while revived subscriptions or blocking methods are pending.
    pub fn waiting_for_quiescence(&self) -> bool {
        !self.subs_being_revived.is_empty() || !self.methods_blocking_quiescence.is_empty()
    }

    pub(crate) fn livedata_data(&mut self, msg: Message) -> Result<()> {
        let standard_write = msg.is_document_write();

        if self.waiting_for_quiescence() {
            match &msg {
                Message::Nosub { id, .. } => {
                    self.subs_being_revived.remove(id);
                }
                Message::Ready { subs } => {
                    for id in subs {
                        self.subs_being_revived.remove(id);
                    }
                }
                Message::Updated { methods } => {
                    for id in methods {
                        self.methods_blocking_quiescence.remove(id);
                    }
                }
                _ => {}
            }
            self.messages_buffered_until_quiescence.push(msg);

            if self.waiting_for_quiescence() {
                return Ok(());
            }

            // Nothing blocks anymore: apply everything at once, in order.
            let buffered = mem::take(&mut self.messages_buffered_until_quiescence);
            log::debug!("Quiescent; applying {} buffered messages", buffered.len());
            for message in buffered {
                self.process_one_data_message(message)?;
            }
        } else {
            self.process_one_data_message(msg)?;
        }

        if self.options.buffered_writes_interval_ms == 0 || !standard_write {
            return self.flush_buffered_writes();
        }

        let now = Instant::now();
        match self.buffered_writes_flush_at {
            None => {
                self.buffered_writes_flush_at = Some(now + self.options.buffered_writes_max_age());
            }
            Some(at) if at < now => return self.flush_buffered_writes(),
            Some(_) => {}
        }
        self.buffered_writes_flush_timer = Some(now + self.options.buffered_writes_interval());
        Ok(())
    }

    pub(crate) fn livedata_nosub(&mut self, id: String, error: Option<crate::error::MethodError>) -> Result<()> {
        // Only used here to make progress towards quiescence.
        self.livedata_data(Message::Nosub {
            id: id.clone(),
            error: error.clone(),
        })?;

        // Unknown: never subscribed, or we sent the unsub ourselves.
        let Some(mut sub) = self.remove_subscription(&id) else {
            return Ok(());
        };

        if let Some(err) = &error {
            log::debug!("Subscription '{}' stopped by server: {err}", sub.name);
            if let Some(callback) = sub.error_callback.take() {
                callback(err.clone());
            }
        }
        if let Some(callback) = sub.stop_callback.take() {
            callback(error);
        }
        Ok(())
    }

    pub(crate) fn livedata_error(&mut self, reason: &str, offending: Option<&serde_json::Value>) {
        log::warn!("Received error from server: {reason}");
        if let Some(offending) = offending {
            log::warn!("For: {offending}");
        }
    }

    // ---------------------------------------------------------------
    // Buffered writes
    // ---------------------------------------------------------------

    pub(crate) fn push_update(&mut self, collection: &str, update: StoreUpdate) {
        self.buffered_writes
            .entry(collection.to_string())
            .or_default()
            .push(update);
    }

    /// Write every pending update to the stores now.
    ///
    /// While waiting for quiescence nothing is written; the updates stay
    /// queued and land with the quiescent batch. A pending store reset never
    /// runs ahead of the data that replaces the store's contents.
    pub fn flush_buffered_writes(&mut self) -> Result<()> {
        self.buffered_writes_flush_timer = None;
        self.buffered_writes_flush_at = None;
        if self.waiting_for_quiescence() {
            return Ok(());
        }
        let writes = mem::take(&mut self.buffered_writes);
        self.perform_writes(writes)
    }

    fn perform_writes(&mut self, updates: HashMap<String, Vec<StoreUpdate>>) -> Result<()> {
        if self.reset_stores || !updates.is_empty() {
            let reset = self.reset_stores;
            for (name, store) in self.stores.iter_mut() {
                store.begin_update(updates.get(name).map_or(0, Vec::len), reset);
            }
            self.reset_stores = false;

            for (name, messages) in updates {
                match self.stores.get_mut(&name) {
                    Some(store) => {
                        for message in messages {
                            store.update(message);
                        }
                    }
                    None => self
                        .updates_for_unknown_stores
                        .entry(name)
                        .or_default()
                        .extend(messages),
                }
            }

            for store in self.stores.values_mut() {
                store.end_update();
            }
        }

        self.run_after_update_callbacks()
    }

    pub(crate) fn run_after_update_callbacks(&mut self) -> Result<()> {
        let callbacks = mem::take(&mut self.after_update_callbacks);
        for callback in callbacks {
            match callback {
                AfterUpdate::SubReady(id) => self.mark_subscription_ready(&id),
                AfterUpdate::DataVisible(id) => self.data_visible(&id)?,
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // User id
    // ---------------------------------------------------------------

    /// The logged-in user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.borrow().clone()
    }

    /// Receiver notified whenever the user id actually changes.
    pub fn watch_user_id(&self) -> watch::Receiver<Option<String>> {
        self.user_id.subscribe()
    }

    /// Set the current user. Watchers are only notified on a change.
    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id.send_if_modified(|current| {
            if *current == user_id {
                return false;
            }
            *current = user_id;
            true
        });
    }

    // ---------------------------------------------------------------
    // Transport controls
    // ---------------------------------------------------------------

    pub(crate) fn send(&mut self, msg: &Message) {
        match msg.encode() {
            Ok(frame) => self.transport.send(frame),
            Err(e) => log::error!("Dropping unencodable '{}' message: {e}", msg.tag()),
        }
    }

    pub(crate) fn lost_connection(&mut self) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.stop();
        }
        self.transport.reconnect(true);
    }

    /// Snapshot of the transport's status.
    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Reconnect now if not connected.
    pub fn reconnect(&mut self) {
        self.transport.reconnect(false);
    }

    /// Disconnect; the transport may reconnect later.
    pub fn disconnect(&mut self) {
        self.transport.disconnect(DisconnectOptions::default());
    }

    /// Disconnect for good.
    pub fn close(&mut self) {
        self.transport.disconnect(DisconnectOptions {
            permanent: true,
            error: None,
        });
    }

    // ---------------------------------------------------------------
    // Reload gate
    // ---------------------------------------------------------------

    /// Whether a reload may happen now. If not, `retry` runs once the last
    /// outstanding method completes.
    pub fn request_migration(&mut self, retry: impl FnOnce() + Send + 'static) -> bool {
        if self.options.reload_with_outstanding || self.ready_to_migrate() {
            return true;
        }
        self.retry_migrate = Some(Box::new(retry));
        false
    }

    pub(crate) fn ready_to_migrate(&self) -> bool {
        self.method_invokers.is_empty()
    }

    pub(crate) fn maybe_migrate(&mut self) {
        if self.retry_migrate.is_some() && self.ready_to_migrate() {
            if let Some(retry) = self.retry_migrate.take() {
                retry();
            }
        }
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Outstanding method blocks, front first.
    pub fn method_blocks(&self) -> Vec<BlockSummary> {
        self.outstanding_method_blocks
            .iter()
            .map(|block| BlockSummary {
                wait: block.wait,
                methods: block.methods.clone(),
            })
            .collect()
    }

    /// Methods still waiting on their result or data.
    pub fn pending_method_count(&self) -> usize {
        self.method_invokers.len()
    }

    /// Whether a stub-written shadow document is tracked for `(collection, id)`.
    pub fn has_server_doc(&self, collection: &str, id: &str) -> bool {
        self.server_documents
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id))
    }

    /// Id of the current session, once connected.
    pub fn session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    /// Protocol version agreed on in the last handshake.
    pub fn negotiated_version(&self) -> Option<&str> {
        self.negotiated_version.as_deref()
    }

    /// Data messages held back until quiescence.
    pub fn buffered_message_count(&self) -> usize {
        self.messages_buffered_until_quiescence.len()
    }
}
