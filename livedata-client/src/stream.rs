//! Stream router: decodes inbound frames and handles transport lifecycle.

use std::time::Instant;

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{Inbound, Message};
use crate::transport::DisconnectOptions;

impl Connection {
    /// Handle one inbound text frame.
    ///
    /// Frames that fail to decode are logged and dropped. Errors returned
    /// from here are invariant violations and leave the connection unusable.
    pub fn on_message(&mut self, raw: &str) -> Result<()> {
        let inbound = match Message::decode(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("Discarding message with invalid JSON: {e}");
                return Ok(());
            }
        };

        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.message_received(Instant::now());
        }

        let msg = match inbound {
            Inbound::Message(msg) => msg,
            Inbound::Handshake => return Ok(()),
            Inbound::Invalid(value) => {
                log::debug!("Discarding invalid livedata message: {value}");
                return Ok(());
            }
        };

        if let Message::Connected { .. } = &msg {
            self.negotiated_version = self.version_suggestion.clone();
        }

        self.route_message(msg)
    }

    fn route_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Connected { session } => {
                self.livedata_connected(session)?;
                if let Some(hook) = self.connected_hook.as_mut() {
                    hook();
                }
                Ok(())
            }
            Message::Failed { version } => {
                self.handle_failed(version);
                Ok(())
            }
            Message::Ping { id } => {
                if self.options.respond_to_pings {
                    self.send(&Message::pong(id));
                }
                Ok(())
            }
            // The heartbeat was already told about this frame.
            Message::Pong { .. } => Ok(()),
            msg @ (Message::Added { .. }
            | Message::Changed { .. }
            | Message::Removed { .. }
            | Message::Ready { .. }
            | Message::Updated { .. }) => self.livedata_data(msg),
            Message::Nosub { id, error } => self.livedata_nosub(id, error),
            Message::Result { id, result, error } => self.livedata_result(id, result, error),
            Message::Error {
                reason,
                offending_message,
            } => {
                self.livedata_error(&reason, offending_message.as_ref());
                Ok(())
            }
            other => {
                log::debug!("discarding unknown livedata message type '{}'", other.tag());
                Ok(())
            }
        }
    }

    fn handle_failed(&mut self, version: String) {
        if self.options.supported_ddp_versions.contains(&version) {
            log::info!("Server asked for DDP version {version}; reconnecting");
            self.version_suggestion = Some(version);
            self.transport.reconnect(true);
            return;
        }

        let description =
            format!("DDP version negotiation failed; server requested version {version}");
        log::error!("{description}");
        self.transport.disconnect(DisconnectOptions {
            permanent: true,
            error: Some(description.clone()),
        });
        if let Some(hook) = self.negotiation_failure_hook.as_mut() {
            hook(&description);
        }
    }

    fn build_connect_message(&mut self) -> Message {
        let version = self
            .version_suggestion
            .clone()
            .or_else(|| self.options.supported_ddp_versions.first().cloned())
            .unwrap_or_else(|| "1".to_string());
        self.version_suggestion = Some(version.clone());

        Message::Connect {
            version,
            support: self.options.supported_ddp_versions.clone(),
            session: self.last_session_id.clone(),
        }
    }

    /// The transport (re)connected. Sends the handshake and replays
    /// outstanding methods and subscriptions.
    pub fn on_reset(&mut self) -> Result<()> {
        let connect = self.build_connect_message();
        self.send(&connect);

        let failed = self.handle_outstanding_methods_on_reset();
        self.call_on_reconnect_and_send_appropriate_outstanding_methods()?;
        self.resend_subscriptions();

        self.fail_unretried_methods(failed)
    }

    pub fn on_disconnect(&mut self) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.stop();
        }
        log::debug!("Transport disconnected");
    }
}
