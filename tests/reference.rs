use syncmap::{
    reference::{DeepCopyMap, RwLockMap},
    ConcurrentMap, SyncMap,
};

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Load(u8),
    Store(u8, u8),
    LoadOrStore(u8, u8),
    LoadAndDelete(u8),
    Delete(u8),
    Swap(u8, u8),
    CompareAndSwap(u8, u8, u8),
    CompareAndDelete(u8, u8),
    Range,
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Value(Option<u8>),
    LoadOrStore(u8, bool),
    Flag(bool),
    Entries(Vec<(u8, u8)>),
    Unit,
}

// few keys and values so that operations collide often
fn op() -> impl Strategy<Value = Op> {
    let key = 0..8u8;
    let value = 0..4u8;

    prop_oneof![
        key.clone().prop_map(Op::Load),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Store(k, v)),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::LoadOrStore(k, v)),
        key.clone().prop_map(Op::LoadAndDelete),
        key.clone().prop_map(Op::Delete),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Swap(k, v)),
        (key.clone(), value.clone(), value.clone())
            .prop_map(|(k, old, new)| Op::CompareAndSwap(k, old, new)),
        (key, value).prop_map(|(k, v)| Op::CompareAndDelete(k, v)),
        Just(Op::Range),
    ]
}

fn apply<M: ConcurrentMap<u8, u8>>(map: &M, op: &Op) -> Outcome {
    match *op {
        Op::Load(k) => Outcome::Value(map.load(&k)),
        Op::Store(k, v) => {
            map.store(k, v);

            Outcome::Unit
        }
        Op::LoadOrStore(k, v) => {
            let (actual, loaded) = map.load_or_store(k, v);

            Outcome::LoadOrStore(actual, loaded)
        }
        Op::LoadAndDelete(k) => Outcome::Value(map.load_and_delete(&k)),
        Op::Delete(k) => {
            map.delete(&k);

            Outcome::Unit
        }
        Op::Swap(k, v) => Outcome::Value(map.swap(k, v)),
        Op::CompareAndSwap(k, old, new) => Outcome::Flag(map.compare_and_swap(&k, &old, new)),
        Op::CompareAndDelete(k, old) => Outcome::Flag(map.compare_and_delete(&k, &old)),
        Op::Range => {
            let mut entries = Vec::new();
            map.range(|k, v| {
                entries.push((*k, *v));

                true
            });
            entries.sort_unstable();

            Outcome::Entries(entries)
        }
    }
}

fn run<M: ConcurrentMap<u8, u8> + Default>(ops: &[Op]) -> Vec<Outcome> {
    let map = M::default();

    ops.iter().map(|op| apply(&map, op)).collect()
}

proptest! {
    #[test]
    fn sync_map_matches_rw_lock_map(ops in proptest::collection::vec(op(), 0..256)) {
        prop_assert_eq!(run::<SyncMap<u8, u8>>(&ops), run::<RwLockMap<u8, u8>>(&ops));
    }

    #[test]
    fn deep_copy_map_matches_rw_lock_map(ops in proptest::collection::vec(op(), 0..256)) {
        prop_assert_eq!(run::<DeepCopyMap<u8, u8>>(&ops), run::<RwLockMap<u8, u8>>(&ops));
    }
}

#[test]
fn range_visits_stable_keys_once_during_writes() {
    const NUM_STABLE: usize = 256;
    const NUM_RANGES: usize = 64;

    let map = Arc::new(SyncMap::new());

    for i in 0..NUM_STABLE {
        map.store(i, i);
    }

    let keep_running = Arc::new(AtomicBool::new(true));

    let writer = {
        let map = map.clone();
        let keep_running = keep_running.clone();

        thread::spawn(move || {
            let mut key = NUM_STABLE;

            while keep_running.load(Ordering::Relaxed) {
                map.store(key, key);
                map.load(&key);
                map.delete(&key);
                key += 1;
            }
        })
    };

    for _ in 0..NUM_RANGES {
        let mut seen = HashSet::new();

        map.range(|&k, &v| {
            assert_eq!(k, v);
            assert!(seen.insert(k), "key {} visited twice", k);

            true
        });

        assert!((0..NUM_STABLE).all(|k| seen.contains(&k)));
    }

    keep_running.store(false, Ordering::Relaxed);
    assert!(writer.join().is_ok());
}
