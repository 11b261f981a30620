//! Model-checked interleavings of the Chase–Lev deque.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --test loom_deque --release`

#![cfg(loom)]

use forge::exec::{Steal, Worker};

/// Owner pops race a stealer for the last element: exactly one side wins,
/// nothing is lost, nothing is duplicated.
#[test]
fn last_element_race() {
    loom::model(|| {
        let worker = Worker::new(2);
        worker.push(1u32);

        let stealer = worker.stealer();
        let thief = loom::thread::spawn(move || match stealer.steal() {
            Steal::Success(value) => Some(value),
            _ => None,
        });

        let popped = worker.pop();
        let stolen = thief.join().unwrap();

        let taken = [popped, stolen].into_iter().flatten().collect::<Vec<_>>();
        assert_eq!(taken, vec![1], "exactly one side takes the element");
    });
}

/// Two stealers never take the same element.
#[test]
fn concurrent_stealers_are_disjoint() {
    loom::model(|| {
        let worker = Worker::new(4);
        worker.push(1u32);
        worker.push(2);

        let threads = (0..2)
            .map(|_| {
                let stealer = worker.stealer();
                loom::thread::spawn(move || match stealer.steal() {
                    Steal::Success(value) => Some(value),
                    _ => None,
                })
            })
            .collect::<Vec<_>>();

        let taken = threads
            .into_iter()
            .filter_map(|thread| thread.join().unwrap())
            .collect::<Vec<_>>();

        let mut remaining = Vec::new();
        while let Some(value) = worker.pop() {
            remaining.push(value);
        }

        let mut all = taken;
        all.extend(remaining);
        all.sort_unstable();
        assert_eq!(all, vec![1, 2], "every element taken exactly once");
    });
}

/// Push concurrent with steal: the stealer sees either nothing or a valid
/// element; the owner drains whatever remains.
#[test]
fn push_vs_steal() {
    loom::model(|| {
        let worker = Worker::new(2);
        worker.push(1u32);

        let stealer = worker.stealer();
        let thief = loom::thread::spawn(move || {
            match stealer.steal() {
                Steal::Success(value) => Some(value),
                _ => None,
            }
        });

        worker.push(2);

        let stolen = thief.join().unwrap();
        let mut drained = Vec::new();
        while let Some(value) = worker.pop() {
            drained.push(value);
        }

        let mut all = stolen.into_iter().collect::<Vec<_>>();
        all.extend(drained);
        all.sort_unstable();
        assert_eq!(all, vec![1, 2]);
    });
}
