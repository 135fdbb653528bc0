//! B+Tree benchmarks: point inserts, point reads and full scans over a
//! tree at natural page capacity, plus a deep-tree variant with tiny
//! nodes to exercise the split machinery.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use arbor::{
    BPlusTree, BufferPoolManager, GenericComparator, GenericKey, PageFile, Rid, Transaction,
};

type Key = GenericKey<8>;
type Tree = BPlusTree<Key, GenericComparator<8>>;

fn make_tree(dir: &tempfile::TempDir) -> Tree {
    let file = PageFile::create(dir.path().join("bench.idx")).unwrap();
    let pool = Arc::new(BufferPoolManager::new(256, file).unwrap());
    Tree::new("bench_idx", pool, GenericComparator::<8>).unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert");

    for count in [1_000i64, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("sequential", count),
            &count,
            |b, &count| {
                b.iter_with_setup(
                    || {
                        let dir = tempdir().unwrap();
                        let tree = make_tree(&dir);
                        (dir, tree)
                    },
                    |(dir, tree)| {
                        {
                            let txn = Transaction::new();
                            for k in 0..count {
                                tree.insert(&Key::from_i64(k), &Rid::from_key(k), &txn)
                                    .unwrap();
                            }
                        }
                        (dir, tree)
                    },
                );
            },
        );
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_get");

    let dir = tempdir().unwrap();
    let tree = make_tree(&dir);
    let txn = Transaction::new();
    for k in 0..10_000i64 {
        tree.insert(&Key::from_i64(k), &Rid::from_key(k), &txn)
            .unwrap();
    }

    group.bench_function("existing_key", |b| {
        let mut k = 0i64;
        b.iter(|| {
            k = (k + 7_919) % 10_000;
            black_box(tree.get(&Key::from_i64(k), &txn).unwrap())
        });
    });

    group.bench_function("absent_key", |b| {
        b.iter(|| black_box(tree.get(&Key::from_i64(-1), &txn).unwrap()));
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_scan");
    group.throughput(Throughput::Elements(10_000));

    let dir = tempdir().unwrap();
    let tree = make_tree(&dir);
    let txn = Transaction::new();
    for k in 0..10_000i64 {
        tree.insert(&Key::from_i64(k), &Rid::from_key(k), &txn)
            .unwrap();
    }

    group.bench_function("full_iteration", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            for item in tree.begin(&txn).unwrap() {
                sum += item.unwrap().0.to_i64();
            }
            black_box(sum)
        });
    });

    group.finish();
}

fn bench_deep_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_deep_tree");
    group.throughput(Throughput::Elements(2_000));

    group.bench_function("tiny_nodes_insert_remove", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let file = PageFile::create(dir.path().join("deep.idx")).unwrap();
                let pool = Arc::new(BufferPoolManager::new(256, file).unwrap());
                let tree =
                    Tree::with_max_sizes("deep_idx", pool, GenericComparator::<8>, 4, 4).unwrap();
                (dir, tree)
            },
            |(dir, tree)| {
                {
                    let txn = Transaction::new();
                    for k in 0..1_000i64 {
                        tree.insert(&Key::from_i64(k), &Rid::from_key(k), &txn)
                            .unwrap();
                    }
                    for k in 0..1_000i64 {
                        tree.remove(&Key::from_i64(k), &txn).unwrap();
                    }
                }
                (dir, tree)
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_get, bench_scan, bench_deep_tree);
criterion_main!(benches);
