use syncmap::SyncMap;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

fn main() {
    const NUM_READERS: usize = 64;
    const NUM_STABLE: usize = 1024;

    let keep_running = Arc::new(AtomicBool::new(true));
    let num_loads = Arc::new(AtomicUsize::new(0));
    let map = Arc::new(SyncMap::new());

    for i in 0..NUM_STABLE {
        map.store(i, i);
    }

    let readers: Vec<_> = (0..NUM_READERS)
        .map(|_| {
            let keep_running = keep_running.clone();
            let num_loads = num_loads.clone();
            let map = map.clone();

            thread::spawn(move || {
                while keep_running.load(Ordering::Relaxed) {
                    for i in 0..NUM_STABLE {
                        assert_eq!(map.load(&i), Some(i));
                    }

                    num_loads.fetch_add(NUM_STABLE, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let writer = {
        let keep_running = keep_running.clone();
        let map = map.clone();

        thread::spawn(move || {
            let mut key = NUM_STABLE;

            while keep_running.load(Ordering::Relaxed) {
                map.store(key, key);

                if key > NUM_STABLE {
                    map.delete(&(key - 1));
                }

                key += 1;
            }

            key - NUM_STABLE
        })
    };

    thread::sleep(Duration::from_secs(5));
    keep_running.store(false, Ordering::Relaxed);

    for result in readers.into_iter().map(|t| t.join()) {
        assert!(result.is_ok());
    }

    let num_stores = writer.join().unwrap_or(0);

    println!(
        "{} loads, {} stores",
        num_loads.load(Ordering::Relaxed),
        num_stores
    );
}
