use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use memsync::latch::CountdownLatch;
use test_env_log::test;

#[test]
fn waiters_see_all_releases() {
    let latch = Arc::new(CountdownLatch::new(3));
    let released = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let c_latch = latch.clone();
            let c_released = released.clone();
            thread::spawn(move || {
                c_latch.wait();
                assert_eq!(3, c_released.load(Ordering::SeqCst));
            })
        })
        .collect();

    let releasers: Vec<_> = (0..3)
        .map(|i| {
            let c_latch = latch.clone();
            let c_released = released.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10 * i));
                c_released.fetch_add(1, Ordering::SeqCst);
                c_latch.release().unwrap();
            })
        })
        .collect();

    for handle in releasers {
        handle.join().unwrap();
    }
    for handle in waiters {
        handle.join().unwrap();
    }
}

#[test]
fn referenced_work() {
    let latch = Arc::new(CountdownLatch::new(1));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            latch.reference().unwrap();
            let c_latch = latch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                c_latch.release().unwrap();
            })
        })
        .collect();

    // Drop the initial Reference once all the Work was handed out
    latch.release().unwrap();
    assert!(latch.wait_for(Duration::from_secs(10)));
    log::info!("{:?}", latch);

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn missing_release_times_out() {
    let latch = CountdownLatch::new(2);
    latch.release().unwrap();

    assert!(!latch.wait_for(Duration::from_millis(10)));
}
