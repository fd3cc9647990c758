use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lrukit::cache::LruCache;
use lrukit::ds::{LinkedList, LruList};

fn bench_linked_list_push_move(c: &mut Criterion) {
    c.bench_function("linked_list_push_move", |b| {
        b.iter_batched(
            || {
                let list = LinkedList::new();
                let elements: Vec<_> = (0..1024u64).map(|i| list.push_back(i)).collect();
                (list, elements)
            },
            |(list, elements)| {
                for e in &elements {
                    list.move_to_front(black_box(e));
                }
                for e in &elements {
                    let _ = black_box(list.remove(e));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_lru_list_churn(c: &mut Criterion) {
    c.bench_function("lru_list_push_pop", |b| {
        b.iter_batched(
            || {
                let list = LruList::new();
                for i in 0..1024u64 {
                    list.push_front(i);
                }
                list.wait_for_insertions();
                list
            },
            |list| {
                for i in 0..1024u64 {
                    list.push_front(black_box(i + 10_000));
                }
                list.wait_for_insertions();
                for _ in 0..1024 {
                    let _ = black_box(list.pop_back());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_cache_add_get(c: &mut Criterion) {
    c.bench_function("cache_add_get", |b| {
        b.iter_batched(
            || {
                let cache = LruCache::new(2048).unwrap();
                for i in 0..1024u64 {
                    cache.add(i.to_string(), i);
                }
                cache
            },
            |cache| {
                for i in 0..1024u64 {
                    let key = i.to_string();
                    cache.add(black_box(key.clone()), i);
                    let _ = black_box(cache.get(&key));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_linked_list_push_move,
    bench_lru_list_churn,
    bench_cache_add_get
);
criterion_main!(benches);
