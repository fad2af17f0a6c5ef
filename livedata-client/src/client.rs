//! Async front end: runs a [`Connection`] on its own tokio task.
//!
//! The task owns the connection and multiplexes three inputs with
//! `tokio::select!`: transport events, commands from [`LiveClient`] handles,
//! and the connection's next timer deadline. Everything the connection does
//! therefore happens on one task, in arrival order.

use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{DdpError, MethodError, Result};
use crate::methods::ApplyOptions;
use crate::subscription::{SubscriptionCallbacks, SubscriptionHandle};
use crate::transport::{ConnectionStatus, TransportEvent};

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

enum ConnCmd {
    /// Run a closure against the connection.
    Run(Job),
    /// Disconnect permanently and stop the task.
    Shutdown,
}

/// Cloneable handle to a running connection task.
#[derive(Clone)]
pub struct LiveClient {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
}

impl LiveClient {
    /// Move `connection` onto a new task fed by `events`.
    ///
    /// The task ends when every handle is dropped, on [`close`](Self::close),
    /// when the event channel closes, or with the first invariant error.
    pub fn spawn(
        connection: Connection,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(connection, events, cmd_rx));
        (Self { cmd_tx }, task)
    }

    /// Run `f` on the connection task and return its result.
    pub async fn with<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = result_tx.send(f(conn));
        });
        self.cmd_tx
            .send(ConnCmd::Run(job))
            .map_err(|_| DdpError::ConnectionClosed)?;
        result_rx.await.map_err(|_| DdpError::ConnectionClosed)
    }

    /// Call a method and wait for its outcome.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<std::result::Result<Value, MethodError>> {
        self.apply(name, args, ApplyOptions::default()).await
    }

    pub async fn apply(
        &self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
    ) -> Result<std::result::Result<Value, MethodError>> {
        let name = name.to_string();
        let promise = self
            .with(move |conn| conn.apply_async(&name, args, options))
            .await??;
        Ok(promise.await)
    }

    pub async fn subscribe(
        &self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<SubscriptionHandle> {
        let name = name.to_string();
        self.with(move |conn| conn.subscribe(&name, params, callbacks))
            .await
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with(move |conn| conn.unsubscribe(&id)).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus> {
        self.with(|conn| conn.status()).await
    }

    pub async fn user_id(&self) -> Result<Option<String>> {
        self.with(|conn| conn.user_id()).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.with(|conn| conn.reconnect()).await
    }

    /// Stop the connection task. Pending method futures resolve with a
    /// `connection-lost` error.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown);
    }
}

async fn run_connection(
    mut conn: Connection,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
) -> Result<()> {
    let outcome = drive(&mut conn, &mut events, &mut cmd_rx).await;
    if let Err(e) = &outcome {
        log::error!("Live-data connection stopped: {e}");
    }
    conn.close();
    outcome
}

async fn drive(
    conn: &mut Connection,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
) -> Result<()> {
    loop {
        let deadline = conn.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => conn.handle_event(event)?,
                None => {
                    log::debug!("Transport event channel closed");
                    return Ok(());
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Run(job)) => job(conn),
                Some(ConnCmd::Shutdown) | None => return Ok(()),
            },
            _ = timer => conn.handle_timers(Instant::now())?,
        }
    }
}
