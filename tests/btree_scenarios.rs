//! End-to-end index scenarios: fill/drain sequences, permutations and
//! concurrency coverage. Each test finishes with a full structural walk
//! (`check_integrity`), so a split or merge that leaves the tree subtly
//! wrong fails here even when the point lookups still happen to work.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

use arbor::{
    BPlusTree, BufferPoolManager, GenericComparator, GenericKey, PageFile, Rid, Transaction,
};

type Key = GenericKey<8>;
type Tree = BPlusTree<Key, GenericComparator<8>>;

const CMP: GenericComparator<8> = GenericComparator::<8>;

fn key(v: i64) -> Key {
    Key::from_i64(v)
}

fn tiny_tree() -> (tempfile::TempDir, Tree) {
    let dir = tempdir().unwrap();
    let file = PageFile::create(dir.path().join("scenario.idx")).unwrap();
    let pool = Arc::new(BufferPoolManager::new(64, file).unwrap());
    let tree = Tree::with_max_sizes("scenario_idx", pool, CMP, 4, 4).unwrap();
    (dir, tree)
}

fn insert_all<'a>(tree: &'a Tree, txn: &Transaction<'a>, keys: impl IntoIterator<Item = i64>) {
    for k in keys {
        assert!(
            tree.insert(&key(k), &Rid::from_key(k), txn).unwrap(),
            "insert {} was rejected",
            k
        );
    }
}

fn collect_keys(tree: &Tree, txn: &Transaction<'_>) -> Vec<i64> {
    tree.begin(txn)
        .unwrap()
        .map(|item| item.unwrap().0.to_i64())
        .collect()
}

#[test]
fn sequential_fill_then_point_reads() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, 1..=4);

    assert_eq!(tree.get(&key(3), &txn).unwrap(), Some(Rid::from_key(3)));
    assert_eq!(collect_keys(&tree, &txn), vec![1, 2, 3, 4]);
    assert_eq!(tree.check_integrity(&txn).unwrap(), 4);
}

#[test]
fn overflow_grows_a_root_and_links_the_leaves() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, 1..=5);

    assert_eq!(collect_keys(&tree, &txn), vec![1, 2, 3, 4, 5]);
    for k in 1..=5 {
        assert_eq!(tree.get(&key(k), &txn).unwrap(), Some(Rid::from_key(k)));
    }
    assert_eq!(tree.check_integrity(&txn).unwrap(), 5);
}

#[test]
fn remove_from_the_middle_keeps_the_rest() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, 1..=10);
    tree.remove(&key(5), &txn).unwrap();

    assert_eq!(tree.get(&key(5), &txn).unwrap(), None);
    assert_eq!(
        collect_keys(&tree, &txn),
        vec![1, 2, 3, 4, 6, 7, 8, 9, 10]
    );
    assert_eq!(tree.check_integrity(&txn).unwrap(), 9);
}

#[test]
fn prefix_removal_rebalances_and_survives() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, 1..=10);
    for k in 1..=3 {
        tree.remove(&key(k), &txn).unwrap();
        tree.check_integrity(&txn).unwrap();
    }

    assert_eq!(collect_keys(&tree, &txn), (4..=10).collect::<Vec<_>>());
}

#[test]
fn filling_then_draining_in_reverse_leaves_nothing() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, 1..=20);
    for k in (1..=20).rev() {
        tree.remove(&key(k), &txn).unwrap();
    }

    assert!(tree.is_empty());
    // The walk also checks that the header page records the invalid root.
    assert_eq!(tree.check_integrity(&txn).unwrap(), 0);
}

#[test]
fn second_insert_of_a_key_keeps_the_first_rid() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    let first = Rid::new(0, 1, 1);
    let second = Rid::new(0, 9, 9);
    assert!(tree.insert(&key(7), &first, &txn).unwrap());
    assert!(!tree.insert(&key(7), &second, &txn).unwrap());

    assert_eq!(tree.get(&key(7), &txn).unwrap(), Some(first));
}

#[test]
fn any_insertion_order_yields_sorted_iteration() {
    let mut rng = StdRng::seed_from_u64(0xB7EE);
    for round in 0..8 {
        let (_dir, tree) = tiny_tree();
        let txn = Transaction::new();

        let mut keys: Vec<i64> = (1..=120).collect();
        keys.shuffle(&mut rng);
        insert_all(&tree, &txn, keys.iter().copied());

        assert_eq!(
            collect_keys(&tree, &txn),
            (1..=120).collect::<Vec<_>>(),
            "round {}",
            round
        );
        assert_eq!(tree.check_integrity(&txn).unwrap(), 120);
    }
}

#[test]
fn random_removal_order_always_drains_cleanly() {
    let mut rng = StdRng::seed_from_u64(0xD3AD);
    for round in 0..8 {
        let (_dir, tree) = tiny_tree();
        let txn = Transaction::new();

        insert_all(&tree, &txn, 1..=80);

        let mut keys: Vec<i64> = (1..=80).collect();
        keys.shuffle(&mut rng);

        for (i, &k) in keys.iter().enumerate() {
            tree.remove(&key(k), &txn).unwrap();
            if i % 16 == 0 {
                tree.check_integrity(&txn).unwrap();
            }
        }

        assert!(tree.is_empty(), "round {}", round);
        assert_eq!(tree.check_integrity(&txn).unwrap(), 0);
    }
}

#[test]
fn interleaved_inserts_and_removes_stay_consistent() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut present = std::collections::BTreeSet::new();

    let mut keys: Vec<i64> = (1..=200).collect();
    keys.shuffle(&mut rng);

    for chunk in keys.chunks(20) {
        for &k in chunk {
            insert_all(&tree, &txn, [k]);
            present.insert(k);
        }
        // Remove a third of what is currently present.
        let victims: Vec<i64> = present.iter().copied().step_by(3).collect();
        for k in victims {
            tree.remove(&key(k), &txn).unwrap();
            present.remove(&k);
        }
        tree.check_integrity(&txn).unwrap();
    }

    let expected: Vec<i64> = present.iter().copied().collect();
    assert_eq!(collect_keys(&tree, &txn), expected);
}

#[test]
fn range_scan_starts_at_the_lower_bound() {
    let (_dir, tree) = tiny_tree();
    let txn = Transaction::new();

    insert_all(&tree, &txn, (2..=40).step_by(2));

    let tail: Vec<i64> = tree
        .begin_at(&key(21), &txn)
        .unwrap()
        .map(|item| item.unwrap().0.to_i64())
        .collect();
    assert_eq!(tail, (22..=40).step_by(2).collect::<Vec<_>>());
}

#[test]
fn concurrent_writers_on_disjoint_ranges() {
    let dir = tempdir().unwrap();
    let file = PageFile::create(dir.path().join("concurrent.idx")).unwrap();
    let pool = Arc::new(BufferPoolManager::new(128, file).unwrap());
    let tree = Tree::with_max_sizes("concurrent_idx", pool, CMP, 4, 4).unwrap();

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 150;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = &tree;
            scope.spawn(move || {
                let txn = Transaction::new();
                let base = t * 10_000;
                for k in base..base + PER_THREAD {
                    assert!(tree.insert(&key(k), &Rid::from_key(k), &txn).unwrap());
                }
            });
        }
    });

    let txn = Transaction::new();
    assert_eq!(
        tree.check_integrity(&txn).unwrap(),
        (THREADS * PER_THREAD) as usize
    );
    for t in 0..THREADS {
        let base = t * 10_000;
        for k in [base, base + PER_THREAD / 2, base + PER_THREAD - 1] {
            assert_eq!(tree.get(&key(k), &txn).unwrap(), Some(Rid::from_key(k)));
        }
    }
}

#[test]
fn concurrent_readers_see_a_stable_prefix() {
    let dir = tempdir().unwrap();
    let file = PageFile::create(dir.path().join("mixed.idx")).unwrap();
    let pool = Arc::new(BufferPoolManager::new(128, file).unwrap());
    let tree = Tree::with_max_sizes("mixed_idx", pool, CMP, 4, 4).unwrap();

    // A settled prefix that readers hammer while a writer extends the
    // tree above it.
    {
        let txn = Transaction::new();
        insert_all(&tree, &txn, 1..=100);
    }

    std::thread::scope(|scope| {
        let tree = &tree;
        scope.spawn(move || {
            let txn = Transaction::new();
            for k in 101..=400 {
                assert!(tree.insert(&key(k), &Rid::from_key(k), &txn).unwrap());
            }
        });

        for _ in 0..3 {
            scope.spawn(move || {
                let txn = Transaction::new();
                for pass in 0..20 {
                    for k in 1..=100 {
                        assert_eq!(
                            tree.get(&key(k), &txn).unwrap(),
                            Some(Rid::from_key(k)),
                            "pass {} lost key {}",
                            pass,
                            k
                        );
                    }
                }
            });
        }
    });

    let txn = Transaction::new();
    assert_eq!(tree.check_integrity(&txn).unwrap(), 400);
}
