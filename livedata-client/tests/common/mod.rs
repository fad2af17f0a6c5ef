//! Shared fixtures: a transport that records everything and a connection
//! already past its handshake.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use livedata_client::{
    Connection, ConnectionOptions, ConnectionStatus, DisconnectOptions, LocalCollection, StatusKind,
    Transport, TransportEvent,
};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Recorded {
    pub sent: Vec<Value>,
    pub reconnects: Vec<bool>,
    pub disconnects: Vec<DisconnectOptions>,
}

/// Transport double. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return every frame sent so far.
    pub fn take_sent(&self) -> Vec<Value> {
        std::mem::take(&mut self.state.lock().unwrap().sent)
    }

    pub fn reconnects(&self) -> Vec<bool> {
        self.state.lock().unwrap().reconnects.clone()
    }

    pub fn disconnects(&self) -> Vec<DisconnectOptions> {
        self.state.lock().unwrap().disconnects.clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, frame: String) {
        let value = serde_json::from_str(&frame).expect("client sent invalid JSON");
        self.state.lock().unwrap().sent.push(value);
    }

    fn reconnect(&mut self, force: bool) {
        self.state.lock().unwrap().reconnects.push(force);
    }

    fn disconnect(&mut self, options: DisconnectOptions) {
        self.state.lock().unwrap().disconnects.push(options);
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::new(StatusKind::Connected)
    }
}

pub struct Harness {
    pub conn: Connection,
    pub transport: RecordingTransport,
    pub items: LocalCollection,
}

impl Harness {
    /// Unbuffered connection with an `items` store, connected as session `s1`.
    pub fn connected() -> Self {
        Self::connected_with(ConnectionOptions::unbuffered())
    }

    pub fn connected_with(options: ConnectionOptions) -> Self {
        let transport = RecordingTransport::new();
        let mut conn = Connection::new(Box::new(transport.clone()), options);
        let items = LocalCollection::new();
        conn.register_store("items", items.store()).unwrap();

        conn.handle_event(TransportEvent::Reset).unwrap();
        conn.on_message(r#"{"msg":"connected","session":"s1"}"#).unwrap();
        transport.take_sent();

        Self {
            conn,
            transport,
            items,
        }
    }

    /// Deliver a server frame.
    pub fn recv(&mut self, msg: Value) {
        self.conn.on_message(&msg.to_string()).unwrap();
    }

    /// Drop and re-establish the transport.
    pub fn bounce(&mut self) {
        self.conn.handle_event(TransportEvent::Disconnect).unwrap();
        self.conn.handle_event(TransportEvent::Reset).unwrap();
    }

    /// Sent frames with the given `msg` tag, draining the record.
    pub fn sent_with_tag(&self, tag: &str) -> Vec<Value> {
        self.transport
            .take_sent()
            .into_iter()
            .filter(|m| m["msg"] == tag)
            .collect()
    }
}

/// Collects callback outcomes in firing order.
#[derive(Debug, Clone)]
pub struct Log<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Log<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
