//! Method pipeline: stub simulation, ordering blocks, and completion.
//!
//! Outstanding methods are grouped into blocks. Only the front block is on
//! the wire. A `wait` method always sits alone in its block, so nothing
//! queued behind it is sent until it has fully completed; consecutive
//! non-wait methods share a block and travel together.
//!
//! A method completes when both its `result` has arrived and the data it
//! wrote has become visible (its `updated`, after the shadow documents it
//! touched were flushed). Only then does its callback run.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{DdpError, MethodError, Result};
use crate::protocol::Message;

/// Client-side simulation of a server method.
pub type StubFn =
    Arc<dyn Fn(&mut MethodInvocation<'_>, Vec<Value>) -> std::result::Result<Value, MethodError> + Send + Sync>;

/// Final outcome of a method call.
pub type MethodCallback = Box<dyn FnOnce(std::result::Result<Value, MethodError>) + Send>;

/// Runs as soon as the result arrives, before data visibility.
pub type ResultReceivedCallback = Box<dyn FnOnce(&std::result::Result<Value, MethodError>) + Send>;

#[derive(Default)]
pub struct ApplyOptions {
    /// Hold back every later method until this one completes.
    pub wait: bool,
    /// Fail instead of resending if the connection drops after sending.
    pub no_retry: bool,
    /// A failing stub aborts the call instead of being logged.
    pub throw_stub_exceptions: bool,
    /// Return the stub's value from `apply`.
    pub return_stub_value: bool,
    pub on_result_received: Option<ResultReceivedCallback>,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold later methods until this one's result and data have arrived.
    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Fail instead of resending if the connection drops first.
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// Return a failing stub's error and skip the RPC.
    pub fn throw_stub_exceptions(mut self) -> Self {
        self.throw_stub_exceptions = true;
        self
    }

    /// Hand back the stub's value from `apply`.
    pub fn return_stub_value(mut self) -> Self {
        self.return_stub_value = true;
        self
    }

    pub fn on_result_received(
        mut self,
        f: impl FnOnce(&std::result::Result<Value, MethodError>) + Send + 'static,
    ) -> Self {
        self.on_result_received = Some(Box::new(f));
        self
    }
}

pub(crate) struct MethodInvoker {
    pub(crate) message: Message,
    callback: Option<MethodCallback>,
    on_result_received: Option<ResultReceivedCallback>,
    pub(crate) wait: bool,
    pub(crate) no_retry: bool,
    pub(crate) sent_message: bool,
    result: Option<std::result::Result<Value, MethodError>>,
    data_visible: bool,
}

impl MethodInvoker {
    pub(crate) fn got_result(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MethodBlock {
    pub(crate) wait: bool,
    /// Ids of methods in this block still waiting for a result.
    pub(crate) methods: Vec<String>,
}

// ---------------------------------------------------------------
// Simulation context
// ---------------------------------------------------------------

/// Lazily realized random seed. A nested invocation derives its seed from
/// the enclosing one, so client and server agree on generated ids.
#[derive(Debug)]
struct SeedCell {
    method: String,
    value: RefCell<Option<String>>,
    enclosing: Option<Rc<SeedCell>>,
}

const SEED_LEN: usize = 20;

impl SeedCell {
    fn root(method: &str) -> Rc<Self> {
        Rc::new(Self {
            method: method.to_string(),
            value: RefCell::new(None),
            enclosing: None,
        })
    }

    fn nested(enclosing: &Rc<SeedCell>, method: &str) -> Rc<Self> {
        Rc::new(Self {
            method: method.to_string(),
            value: RefCell::new(None),
            enclosing: Some(Rc::clone(enclosing)),
        })
    }

    fn realize(&self) -> String {
        if let Some(seed) = self.value.borrow().as_ref() {
            return seed.clone();
        }
        let seed = match &self.enclosing {
            Some(parent) => {
                let name = format!("{}/rpc/{}", parent.realize(), self.method);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).simple().to_string()
            }
            None => Uuid::new_v4().simple().to_string(),
        };
        let seed = seed[..SEED_LEN].to_string();
        *self.value.borrow_mut() = Some(seed.clone());
        seed
    }

    fn realized(&self) -> Option<String> {
        self.value.borrow().clone()
    }
}

/// Context handed to a stub.
pub struct MethodInvocation<'a> {
    name: String,
    user_id: Option<String>,
    handlers: &'a HashMap<String, StubFn>,
    seed: Rc<SeedCell>,
    user_id_change: Option<Option<String>>,
}

impl<'a> MethodInvocation<'a> {
    fn new(name: &str, user_id: Option<String>, handlers: &'a HashMap<String, StubFn>, seed: Rc<SeedCell>) -> Self {
        Self {
            name: name.to_string(),
            user_id,
            handlers,
            seed,
            user_id_change: None,
        }
    }

    /// Name of the method being simulated.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Always true on the client.
    pub fn is_simulation(&self) -> bool {
        true
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Takes effect on the connection once the stub returns.
    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id.clone();
        self.user_id_change = Some(user_id);
    }

    /// Seed for deterministic id generation. Realizing it makes the seed go
    /// out with the method message.
    pub fn random_seed(&self) -> String {
        self.seed.realize()
    }

    /// Run another method's stub from inside this one. No message is sent;
    /// a method without a stub simulates to `null`.
    pub fn apply(&mut self, name: &str, args: Vec<Value>) -> std::result::Result<Value, MethodError> {
        let Some(stub) = self.handlers.get(name).cloned() else {
            return Ok(Value::Null);
        };
        let mut nested = MethodInvocation::new(
            name,
            self.user_id.clone(),
            self.handlers,
            SeedCell::nested(&self.seed, name),
        );
        let result = stub(&mut nested, args);
        if let Some(change) = nested.user_id_change {
            self.set_user_id(change);
        }
        result
    }
}

struct StubOutcome {
    ran: bool,
    value: Option<std::result::Result<Value, MethodError>>,
    random_seed: Option<String>,
}

// ---------------------------------------------------------------
// Result future
// ---------------------------------------------------------------

/// Future resolving to a method's final outcome.
pub struct MethodPromise {
    stub_value: Option<std::result::Result<Value, MethodError>>,
    receiver: oneshot::Receiver<std::result::Result<Value, MethodError>>,
}

impl MethodPromise {
    /// The stub's own outcome, if one ran and `return_stub_value` was set.
    pub fn stub_value(&self) -> Option<&std::result::Result<Value, MethodError>> {
        self.stub_value.as_ref()
    }
}

impl Future for MethodPromise {
    type Output = std::result::Result<Value, MethodError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(MethodError::connection_lost())))
    }
}

impl Connection {
    /// Register client-side stubs. Names must be unique.
    pub fn methods<I, F>(&mut self, stubs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, F)>,
        F: Fn(&mut MethodInvocation<'_>, Vec<Value>) -> std::result::Result<Value, MethodError>
            + Send
            + Sync
            + 'static,
    {
        for (name, stub) in stubs {
            self.register_method(name, stub)?;
        }
        Ok(())
    }

    /// Register one stub. Fails with `DuplicateMethod` if `name` is taken.
    pub fn register_method<F>(&mut self, name: impl Into<String>, stub: F) -> Result<()>
    where
        F: Fn(&mut MethodInvocation<'_>, Vec<Value>) -> std::result::Result<Value, MethodError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.method_handlers.contains_key(&name) {
            return Err(DdpError::DuplicateMethod(name));
        }
        self.method_handlers.insert(name, Arc::new(stub));
        Ok(())
    }

    /// Invoke a method with default options. `callback` gets the result once
    /// its data is visible; without one, errors are logged.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        self.apply(name, args, ApplyOptions::default(), callback)
    }

    /// Invoke a method: simulate it locally if a stub is registered, then
    /// queue the RPC. Returns the stub's value when `return_stub_value` is
    /// set and the stub succeeded.
    pub fn apply(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        let callback = callback.unwrap_or_else(|| default_callback(name));
        let stub = self.run_stub(name, &args)?;
        let return_stub_value = options.return_stub_value;
        let stub_value = self.dispatch_method(name, args, stub, options, callback)?;
        Ok(if return_stub_value {
            stub_value.and_then(|v| v.ok())
        } else {
            None
        })
    }

    /// Invoke a method with default options and await its outcome through
    /// the returned [`MethodPromise`].
    pub fn call_async(&mut self, name: &str, args: Vec<Value>) -> Result<MethodPromise> {
        self.apply_async(name, args, ApplyOptions::default())
    }

    /// Like [`apply`](Self::apply), with the outcome delivered as a future.
    pub fn apply_async(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
    ) -> Result<MethodPromise> {
        let (tx, receiver) = oneshot::channel();
        let callback: MethodCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        let return_stub_value = options.return_stub_value;
        let stub = self.run_stub(name, &args)?;
        let stub_value = self.dispatch_method(name, args, stub, options, callback)?;
        Ok(MethodPromise {
            stub_value: if return_stub_value { stub_value } else { None },
            receiver,
        })
    }

    fn run_stub(&mut self, name: &str, args: &[Value]) -> Result<StubOutcome> {
        let Some(stub) = self.method_handlers.get(name).cloned() else {
            return Ok(StubOutcome {
                ran: false,
                value: None,
                random_seed: None,
            });
        };

        self.save_originals()?;

        let seed = SeedCell::root(name);
        let mut invocation =
            MethodInvocation::new(name, self.user_id(), &self.method_handlers, Rc::clone(&seed));
        let value = stub(&mut invocation, args.to_vec());
        let user_id_change = invocation.user_id_change.take();
        drop(invocation);

        if let Some(user_id) = user_id_change {
            self.set_user_id(user_id);
        }

        Ok(StubOutcome {
            ran: true,
            value: Some(value),
            random_seed: seed.realized(),
        })
    }

    fn dispatch_method(
        &mut self,
        name: &str,
        args: Vec<Value>,
        stub: StubOutcome,
        options: ApplyOptions,
        callback: MethodCallback,
    ) -> Result<Option<std::result::Result<Value, MethodError>>> {
        let method_id = self.next_method_id.to_string();
        self.next_method_id += 1;

        if stub.ran {
            self.retrieve_and_store_originals(&method_id)?;
        }

        if let Some(Err(err)) = &stub.value {
            if options.throw_stub_exceptions {
                // Undo whatever the stub managed to write before failing.
                self.roll_back_stub_writes(&method_id)?;
                self.flush_buffered_writes()?;
                return Err(DdpError::Stub {
                    method: name.to_string(),
                    source: err.clone(),
                });
            }
            log::warn!("Exception while simulating the effect of invoking '{name}': {err}");
        }

        let message = Message::Method {
            id: method_id.clone(),
            method: name.to_string(),
            params: args,
            random_seed: stub.random_seed,
        };

        self.method_invokers.insert(
            method_id.clone(),
            MethodInvoker {
                message,
                callback: Some(callback),
                on_result_received: options.on_result_received,
                wait: options.wait,
                no_retry: options.no_retry,
                sent_message: false,
                result: None,
                data_visible: false,
            },
        );
        self.add_outstanding_method(method_id, options.wait)?;

        Ok(stub.value)
    }

    fn add_outstanding_method(&mut self, method_id: String, wait: bool) -> Result<()> {
        let blocks = &mut self.outstanding_method_blocks;
        if wait {
            blocks.push_back(MethodBlock {
                wait: true,
                methods: vec![method_id.clone()],
            });
        } else {
            if blocks.back().map_or(true, |block| block.wait) {
                blocks.push_back(MethodBlock::default());
            }
            if let Some(block) = blocks.back_mut() {
                block.methods.push(method_id.clone());
            }
        }

        // A fresh front block goes out right away.
        if self.outstanding_method_blocks.len() == 1 {
            self.send_invoker(&method_id)?;
        }
        Ok(())
    }

    fn send_invoker(&mut self, method_id: &str) -> Result<()> {
        let Some(invoker) = self.method_invokers.get_mut(method_id) else {
            return Err(DdpError::invariant(format!(
                "No invoker for outstanding method {method_id}"
            )));
        };
        if invoker.got_result() {
            return Err(DdpError::invariant(
                "Sending a method that already has a result",
            ));
        }
        invoker.data_visible = false;
        invoker.sent_message = true;
        if invoker.wait {
            self.methods_blocking_quiescence.insert(method_id.to_string());
        }
        let message = invoker.message.clone();
        self.send(&message);
        Ok(())
    }

    pub(crate) fn send_outstanding_methods(&mut self) -> Result<()> {
        let Some(front) = self.outstanding_method_blocks.front() else {
            return Ok(());
        };
        for method_id in front.methods.clone() {
            self.send_invoker(&method_id)?;
        }
        Ok(())
    }

    pub(crate) fn livedata_result(
        &mut self,
        id: String,
        result: Option<Value>,
        error: Option<MethodError>,
    ) -> Result<()> {
        // Data written before the result must be visible when the result's
        // callback runs.
        if !self.buffered_writes.is_empty() {
            self.flush_buffered_writes()?;
        }

        let Some(front) = self.outstanding_method_blocks.front_mut() else {
            log::debug!("Received method result but no methods outstanding");
            return Ok(());
        };
        let Some(position) = front.methods.iter().position(|m| *m == id) else {
            log::debug!("Can't match method response to original method call: {id}");
            return Ok(());
        };
        front.methods.remove(position);

        let outcome = match error {
            Some(err) => Err(err),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        self.receive_result(&id, outcome)
    }

    pub(crate) fn receive_result(
        &mut self,
        method_id: &str,
        outcome: std::result::Result<Value, MethodError>,
    ) -> Result<()> {
        let Some(invoker) = self.method_invokers.get_mut(method_id) else {
            return Err(DdpError::invariant(format!(
                "Result for unknown method {method_id}"
            )));
        };
        if invoker.got_result() {
            return Err(DdpError::invariant("Methods should only receive results once"));
        }
        if let Some(on_result) = invoker.on_result_received.take() {
            on_result(&outcome);
        }
        invoker.result = Some(outcome);
        self.maybe_invoke_callback(method_id)
    }

    pub(crate) fn data_visible(&mut self, method_id: &str) -> Result<()> {
        match self.method_invokers.get_mut(method_id) {
            Some(invoker) => {
                invoker.data_visible = true;
                self.maybe_invoke_callback(method_id)
            }
            None => Ok(()),
        }
    }

    fn maybe_invoke_callback(&mut self, method_id: &str) -> Result<()> {
        let ready = self
            .method_invokers
            .get(method_id)
            .is_some_and(|invoker| invoker.data_visible && invoker.got_result());
        if !ready {
            return Ok(());
        }

        if let Some(mut invoker) = self.method_invokers.remove(method_id) {
            if let (Some(callback), Some(outcome)) = (invoker.callback.take(), invoker.result.take()) {
                callback(outcome);
            }
        }
        self.outstanding_method_finished()
    }

    fn any_methods_are_outstanding(&self) -> bool {
        self.method_invokers.values().any(|invoker| invoker.sent_message)
    }

    fn outstanding_method_finished(&mut self) -> Result<()> {
        if self.any_methods_are_outstanding() {
            return Ok(());
        }

        if let Some(first) = self.outstanding_method_blocks.pop_front() {
            if !first.methods.is_empty() {
                return Err(DdpError::invariant(format!(
                    "No methods outstanding but nonempty block: {:?}",
                    first.methods
                )));
            }
            if !self.outstanding_method_blocks.is_empty() {
                self.send_outstanding_methods()?;
            }
        }

        self.maybe_migrate();
        Ok(())
    }

    /// On reset: fail no-retry methods already on the wire, drop the front
    /// block if that empties it, and mark everything unsent. Returns the
    /// failed ids; their failure is delivered once the rest of the reset
    /// has run.
    pub(crate) fn handle_outstanding_methods_on_reset(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        let invokers = &self.method_invokers;

        if let Some(front) = self.outstanding_method_blocks.front_mut() {
            front.methods.retain(|method_id| {
                let fail = invokers
                    .get(method_id)
                    .is_some_and(|invoker| invoker.sent_message && invoker.no_retry);
                if fail {
                    failed.push(method_id.clone());
                }
                !fail
            });
            if front.methods.is_empty() {
                self.outstanding_method_blocks.pop_front();
            }
        }

        for invoker in self.method_invokers.values_mut() {
            invoker.sent_message = false;
        }
        for method_id in &failed {
            self.methods_blocking_quiescence.remove(method_id);
        }
        failed
    }

    pub(crate) fn fail_unretried_methods(&mut self, failed: Vec<String>) -> Result<()> {
        for method_id in failed {
            log::debug!("Failing no-retry method {method_id} after reconnect");
            self.receive_result(&method_id, Err(MethodError::invocation_failed()))?;
            self.data_visible(&method_id)?;
        }
        Ok(())
    }

    /// Let reconnect hooks queue methods first (e.g. a login), then put the
    /// previously outstanding blocks back behind them.
    pub(crate) fn call_on_reconnect_and_send_appropriate_outstanding_methods(&mut self) -> Result<()> {
        let old_blocks = std::mem::take(&mut self.outstanding_method_blocks);

        let mut hooks = std::mem::take(&mut self.reconnect_hooks);
        for hook in hooks.iter_mut() {
            hook(self);
        }
        hooks.append(&mut self.reconnect_hooks);
        self.reconnect_hooks = hooks;

        self.send_outstanding_method_blocks_messages(old_blocks)
    }

    fn send_outstanding_method_blocks_messages(
        &mut self,
        mut old_blocks: std::collections::VecDeque<MethodBlock>,
    ) -> Result<()> {
        if old_blocks.is_empty() {
            return Ok(());
        }

        if self.outstanding_method_blocks.is_empty() {
            self.outstanding_method_blocks = old_blocks;
            return self.send_outstanding_methods();
        }

        let merge = self
            .outstanding_method_blocks
            .back()
            .is_some_and(|block| !block.wait)
            && old_blocks.front().is_some_and(|block| !block.wait);
        if merge {
            if let Some(first_old) = old_blocks.pop_front() {
                for method_id in first_old.methods {
                    if let Some(last) = self.outstanding_method_blocks.back_mut() {
                        last.methods.push(method_id.clone());
                    }
                    if self.outstanding_method_blocks.len() == 1 {
                        self.send_invoker(&method_id)?;
                    }
                }
            }
        }

        self.outstanding_method_blocks.extend(old_blocks);
        Ok(())
    }
}

fn default_callback(name: &str) -> MethodCallback {
    let name = name.to_string();
    Box::new(move |outcome| {
        if let Err(err) = outcome {
            log::debug!("Error invoking method '{name}': {err}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_seed_is_stable_once_realized() {
        let seed = SeedCell::root("m");
        assert_eq!(seed.realized(), None);
        let first = seed.realize();
        assert_eq!(first.len(), SEED_LEN);
        assert_eq!(seed.realize(), first);
        assert_eq!(seed.realized(), Some(first));
    }

    #[test]
    fn test_nested_seed_is_derived_from_parent() {
        let parent = SeedCell::root("outer");
        let a = SeedCell::nested(&parent, "inner");
        let b = SeedCell::nested(&parent, "inner");
        assert_eq!(a.realize(), b.realize());
        assert_ne!(a.realize(), parent.realize());

        let other = SeedCell::nested(&parent, "other");
        assert_ne!(other.realize(), a.realize());
    }

    #[test]
    fn test_nested_apply_runs_stub_without_rpc() {
        let mut handlers: HashMap<String, StubFn> = HashMap::new();
        handlers.insert(
            "inner".into(),
            Arc::new(|inv: &mut MethodInvocation<'_>, args: Vec<Value>| {
                inv.set_user_id(Some("u2".into()));
                Ok(Value::from(args.len()))
            }),
        );

        let mut invocation = MethodInvocation::new("outer", None, &handlers, SeedCell::root("outer"));
        let value = invocation.apply("inner", vec![Value::Null, Value::Null]).unwrap();
        assert_eq!(value, Value::from(2));
        assert_eq!(invocation.user_id(), Some("u2"));
        assert_eq!(invocation.apply("missing", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn test_options_builder() {
        let opts = ApplyOptions::new().wait().no_retry().return_stub_value();
        assert!(opts.wait && opts.no_retry && opts.return_stub_value);
        assert!(!opts.throw_stub_exceptions);
    }
}
