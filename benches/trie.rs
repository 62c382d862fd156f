//! Subscription trie benchmarks: lookups against a populated trie and
//! subscribe/unsubscribe churn.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use trellismq::protocol::{QoS, SubscriptionOptions};
use trellismq::topic::{parse_filter, ClientSubscription, SubscriptionTrie};

fn populated(devices: usize) -> SubscriptionTrie {
    let trie = SubscriptionTrie::new();
    let options = SubscriptionOptions::with_qos(QoS::AtLeastOnce);
    for i in 0..devices {
        let client = format!("client-{}", i);
        for filter in [
            format!("site/{}/+/temperature", i % 50),
            format!("devices/{}/#", i),
            format!("$share/workers/site/{}/alerts", i % 10),
        ] {
            if let Ok(filter) = parse_filter(&filter) {
                trie.put(&filter, ClientSubscription::new(client.as_str(), options));
            }
        }
    }
    if let Ok(filter) = parse_filter("site/#") {
        trie.put(&filter, ClientSubscription::new("archiver", options));
    }
    trie
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_get");
    for devices in [100, 10_000] {
        let trie = populated(devices);
        group.bench_with_input(BenchmarkId::new("wildcard", devices), &trie, |b, trie| {
            b.iter(|| black_box(trie.get(black_box("site/7/room-3/temperature"))))
        });
        group.bench_with_input(BenchmarkId::new("shared", devices), &trie, |b, trie| {
            b.iter(|| black_box(trie.get(black_box("site/3/alerts"))))
        });
        group.bench_with_input(BenchmarkId::new("miss", devices), &trie, |b, trie| {
            b.iter(|| black_box(trie.get(black_box("other/topic/entirely"))))
        });
    }
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let trie = populated(1_000);
    let options = SubscriptionOptions::with_qos(QoS::AtMostOnce);
    let filters: Vec<_> = (0..64)
        .filter_map(|i| parse_filter(&format!("churn/{}/+/state", i)).ok())
        .collect();

    c.bench_function("trie_put_delete", |b| {
        b.iter(|| {
            for filter in &filters {
                trie.put(filter, ClientSubscription::new("churner", options));
            }
            for filter in &filters {
                trie.delete(filter, |sub| &*sub.client_id == "churner");
            }
        })
    });

    c.bench_function("trie_clear_empty_nodes", |b| {
        b.iter(|| {
            for filter in &filters {
                trie.put(filter, ClientSubscription::new("churner", options));
                trie.delete(filter, |sub| &*sub.client_id == "churner");
            }
            let _ = black_box(trie.clear_empty_nodes());
        })
    });
}

criterion_group!(benches, bench_get, bench_churn);
criterion_main!(benches);
