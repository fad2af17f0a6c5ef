use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livedata_server::{ChangedFields, Fields, SessionCallbacks, SessionCollectionView};
use serde_json::json;

/// Callbacks that discard everything.
struct Sink;

impl SessionCallbacks for Sink {
    fn added(&mut self, _collection: &str, _id: &str, fields: Fields) {
        black_box(fields);
    }
    fn changed(&mut self, _collection: &str, _id: &str, fields: ChangedFields) {
        black_box(fields);
    }
    fn removed(&mut self, _collection: &str, _id: &str) {}
}

fn doc(i: usize) -> Fields {
    let mut fields = Fields::new();
    fields.insert("n".into(), json!(i));
    fields.insert("title".into(), json!("benchmark document"));
    fields.insert("tags".into(), json!(["a", "b"]));
    fields
}

fn bench_added_1k(c: &mut Criterion) {
    c.bench_function("view_added_1k", |b| {
        b.iter(|| {
            let mut view = SessionCollectionView::new("items", Sink);
            for i in 0..1000 {
                view.added("s1", &format!("doc{i}"), doc(i));
            }
            black_box(view.len());
        })
    });
}

fn bench_overlapping_subscriptions(c: &mut Criterion) {
    c.bench_function("view_three_subs_add_then_remove_1k", |b| {
        b.iter(|| {
            let mut view = SessionCollectionView::new("items", Sink);
            for sub in ["s1", "s2", "s3"] {
                for i in 0..1000 {
                    view.added(sub, &format!("doc{i}"), doc(i));
                }
            }
            for sub in ["s2", "s1", "s3"] {
                for i in 0..1000 {
                    view.removed(sub, &format!("doc{i}")).unwrap();
                }
            }
            black_box(view.is_empty());
        })
    });
}

fn bench_lru_churn(c: &mut Criterion) {
    let options = livedata_server::ViewOptions {
        max_documents: 256,
        ..Default::default()
    };
    c.bench_function("view_lru_churn_4k_into_256", |b| {
        b.iter(|| {
            let mut view = SessionCollectionView::with_options("items", Sink, options.clone());
            for i in 0..4096 {
                view.added("s1", &format!("doc{i}"), doc(i));
            }
            black_box(view.len());
        })
    });
}

criterion_group!(
    benches,
    bench_added_1k,
    bench_overlapping_subscriptions,
    bench_lru_churn,
);
criterion_main!(benches);
