//! livedata-probe: subscribe to a DDP publication and watch the cache.
//!
//! ```text
//! livedata-probe [--options <json>] <ws-url> <publication> [collection ...]
//! ```
//!
//! Connects to `<ws-url>` (e.g. `ws://localhost:3000/websocket`), subscribes
//! to `<publication>`, and logs the document count of every listed
//! collection once the subscription is ready and again on Ctrl-C, before
//! exiting. Connection options can be given as JSON with `--options` or in
//! `LIVEDATA_OPTIONS`.
//! Set `RUST_LOG=debug` to see protocol traffic.

use std::error::Error;

use clap::Parser;
use livedata_client::{
    Connection, ConnectionOptions, LiveClient, LocalCollection, SubscriptionCallbacks,
    WebSocketTransport,
};
use log::{info, warn};

#[derive(Parser, Debug)]
#[clap(version, about = "Subscribe to a DDP publication and watch the cache")]
struct Cli {
    /// Server endpoint, e.g. ws://localhost:3000/websocket
    url: String,
    /// Publication to subscribe to
    publication: String,
    /// Collections to cache and report on
    collections: Vec<String>,
    /// Connection options as a JSON object
    #[clap(long, env = "LIVEDATA_OPTIONS")]
    options: Option<String>,
}

impl Cli {
    fn connection_options(&self) -> Result<ConnectionOptions, Box<dyn Error>> {
        Ok(match self.options.as_deref() {
            Some(json) => ConnectionOptions::from_json(json)?,
            None => ConnectionOptions::default(),
        })
    }
}

fn report(collections: &[(String, LocalCollection)]) {
    for (name, collection) in collections {
        info!("{name}: {} documents", collection.len());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let options = cli.connection_options()?;
    let Cli {
        url,
        publication,
        collections: names,
        ..
    } = cli;

    info!("Connecting to {url}...");
    let (transport, events) = WebSocketTransport::connect(url.as_str(), &options);
    let mut status = transport.watch_status();
    let mut conn = Connection::new(Box::new(transport), options);

    let mut collections = Vec::with_capacity(names.len());
    for name in names {
        let collection = LocalCollection::new();
        conn.register_store(name.as_str(), collection.store())?;
        collections.push((name, collection));
    }

    conn.on_version_negotiation_failure(|reason| warn!("{reason}"));
    conn.on_connected(|| info!("DDP session established"));

    let (client, task) = LiveClient::spawn(conn, events);

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!("Transport {} (retry {})", current.status, current.retry_count);
        }
    });

    let stopped = SubscriptionCallbacks::new().on_stop(|err| match err {
        Some(err) => warn!("Subscription stopped: {err}"),
        None => info!("Subscription stopped"),
    });
    let mut sub = client.subscribe(&publication, vec![], stopped).await?;
    if sub.ready().await {
        info!("Subscription '{publication}' ready");
        report(&collections);
    }

    tokio::signal::ctrl_c().await?;
    report(&collections);
    client.close();

    match task.await? {
        Ok(()) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments_and_options_flag() {
        let cli = Cli::try_parse_from([
            "livedata-probe",
            "--options",
            r#"{"heartbeat_interval_ms": 0}"#,
            "ws://localhost:3000/websocket",
            "items",
            "lists",
            "tasks",
        ])
        .unwrap();
        assert_eq!(cli.url, "ws://localhost:3000/websocket");
        assert_eq!(cli.publication, "items");
        assert_eq!(cli.collections, vec!["lists", "tasks"]);
        assert_eq!(cli.connection_options().unwrap().heartbeat_interval_ms, 0);
    }

    #[test]
    fn test_missing_publication_is_rejected() {
        let err = Cli::try_parse_from(["livedata-probe", "ws://localhost:3000/websocket"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
