use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livedata_client::{
    document, Connection, ConnectionOptions, ConnectionStatus, DisconnectOptions, LocalCollection,
    Message, Transport, TransportEvent,
};
use serde_json::{json, Value};

/// Transport that discards everything.
struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, frame: String) {
        black_box(frame);
    }
    fn reconnect(&mut self, _force: bool) {}
    fn disconnect(&mut self, _options: DisconnectOptions) {}
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::default()
    }
}

fn connected() -> (Connection, LocalCollection) {
    let mut conn = Connection::new(Box::new(NullTransport), ConnectionOptions::unbuffered());
    let items = LocalCollection::new();
    conn.register_store("items", items.store()).unwrap();
    conn.handle_event(TransportEvent::Reset).unwrap();
    conn.on_message(r#"{"msg":"connected","session":"bench"}"#).unwrap();
    (conn, items)
}

fn added_frames(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            Message::added(
                "items",
                format!("doc{i}"),
                document([("n", json!(i)), ("title", json!("benchmark document"))]),
            )
            .encode()
            .unwrap()
        })
        .collect()
}

fn bench_decode_added(c: &mut Criterion) {
    let frame = added_frames(1).remove(0);
    c.bench_function("decode_added", |b| {
        b.iter(|| black_box(Message::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_apply_1k_added(c: &mut Criterion) {
    let frames = added_frames(1000);
    c.bench_function("apply_1k_added_unbuffered", |b| {
        b.iter(|| {
            let (mut conn, items) = connected();
            for frame in &frames {
                conn.on_message(frame).unwrap();
            }
            black_box(items.len());
        })
    });
}

fn bench_quiescent_replay_1k(c: &mut Criterion) {
    let frames = added_frames(1000);
    c.bench_function("quiescent_replay_1k", |b| {
        b.iter(|| {
            let (mut conn, items) = connected();
            let sub = conn.subscribe("items", vec![], Default::default());
            let ready = format!(r#"{{"msg":"ready","subs":["{}"]}}"#, sub.id());
            conn.on_message(&ready).unwrap();

            conn.handle_event(TransportEvent::Reset).unwrap();
            conn.on_message(r#"{"msg":"connected","session":"next"}"#).unwrap();
            for frame in &frames {
                conn.on_message(frame).unwrap();
            }
            conn.on_message(&ready).unwrap();
            black_box(items.len());
        })
    });
}

fn bench_stub_round_trip(c: &mut Criterion) {
    c.bench_function("stub_write_then_updated", |b| {
        b.iter(|| {
            let (mut conn, items) = connected();
            let local = items.clone();
            conn.register_method("add", move |_inv, _args: Vec<Value>| {
                local.insert("x", document([("v", json!(1))]));
                Ok(Value::Null)
            })
            .unwrap();
            conn.call("add", vec![], None).unwrap();
            conn.on_message(r#"{"msg":"added","collection":"items","id":"x","fields":{"v":2}}"#)
                .unwrap();
            conn.on_message(r#"{"msg":"result","id":"1"}"#).unwrap();
            conn.on_message(r#"{"msg":"updated","methods":["1"]}"#).unwrap();
            black_box(items.get("x"));
        })
    });
}

criterion_group!(
    benches,
    bench_decode_added,
    bench_apply_1k_added,
    bench_quiescent_replay_1k,
    bench_stub_round_trip,
);
criterion_main!(benches);
