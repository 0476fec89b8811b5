//! Concurrency and durability tests for the circulation engine.

use chrono::NaiveDate;
use shelfdb_core::{
    Availability, CirculationEngine, CirculationError, CopyId, FixedClock, MemberId, Money,
    NewCopy, RetryPolicy, StoreOptions, WalStore,
};
use shelfdb_wal::WalConfig;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
}

fn open_store(dir: &TempDir) -> Arc<WalStore> {
    let options = StoreOptions::default().with_lock_timeout(Duration::from_secs(5));
    Arc::new(WalStore::open(WalConfig::new(dir.path()), options).unwrap())
}

fn engine_for(store: Arc<WalStore>, clock: Arc<FixedClock>) -> Arc<CirculationEngine<WalStore>> {
    Arc::new(
        CirculationEngine::new(store)
            .with_clock(clock)
            .with_retry(RetryPolicy::new(5, Duration::from_millis(1))),
    )
}

/// Availability and open loans must agree for every copy.
fn assert_consistent(store: &WalStore) {
    let open = store.open_loans();
    for copy in store.list_copies() {
        let status = store.copy_status(&copy.id).unwrap();
        let open_for_copy = open.iter().filter(|l| l.copy_id == copy.id).count();
        match status.copy.availability {
            Availability::Issued => {
                assert_eq!(open_for_copy, 1, "issued copy {} without one open loan", copy.id);
                assert!(status.open_loan.is_some());
            }
            Availability::Available => {
                assert_eq!(open_for_copy, 0, "available copy {} has an open loan", copy.id);
                assert!(status.open_loan.is_none());
            }
        }
    }
}

#[test]
fn concurrent_issues_of_one_copy_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.add_copy(NewCopy::new("c1", "Dune", "Frank Herbert")).unwrap();
    let engine = engine_for(Arc::clone(&store), Arc::new(FixedClock::new(start_date())));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.issue_book(&CopyId::new("c1"), &MemberId::new(format!("m{}", i)))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let already_issued = results
        .iter()
        .filter(|r| matches!(r, Err(CirculationError::AlreadyIssued { .. })))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(already_issued, threads - 1);
    assert_eq!(store.open_loans().len(), 1);
    assert_consistent(&store);
}

#[test]
fn concurrent_returns_close_the_loan_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.add_copy(NewCopy::new("c1", "Dune", "Frank Herbert")).unwrap();
    let clock = Arc::new(FixedClock::new(start_date()));
    let engine = engine_for(Arc::clone(&store), Arc::clone(&clock));

    engine
        .issue_book(&CopyId::new("c1"), &MemberId::new("m1"))
        .unwrap();
    clock.advance_days(18);

    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.return_book(&CopyId::new("c1"))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let fines: Vec<Money> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|receipt| receipt.fine))
        .collect();
    assert_eq!(fines, vec![Money::from_units(30)]);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(CirculationError::NoActiveLoan { .. }))));

    let history = store.loan_history(&CopyId::new("c1")).unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].is_open());
    assert_consistent(&store);
}

#[test]
fn mixed_workload_keeps_copies_and_loans_in_step() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let copies = store
        .add_copies("The Rust Programming Language", "Klabnik & Nichols", None, 4)
        .unwrap();
    let engine = engine_for(Arc::clone(&store), Arc::new(FixedClock::new(start_date())));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            let ids: Vec<CopyId> = copies.iter().map(|c| c.id.clone()).collect();
            thread::spawn(move || {
                let member = MemberId::new(format!("m{}", worker));
                for round in 0..50 {
                    let copy_id = &ids[(worker + round) % ids.len()];
                    let outcome = if (worker + round) % 2 == 0 {
                        engine.issue_book(copy_id, &member).map(|_| ())
                    } else {
                        engine.return_book(copy_id).map(|_| ())
                    };
                    match outcome {
                        Ok(())
                        | Err(CirculationError::AlreadyIssued { .. })
                        | Err(CirculationError::NoActiveLoan { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_consistent(&store);
    let stats = store.stats();
    assert_eq!(stats.copies, 4);
    assert_eq!(stats.issued, stats.open_loans);
    assert_eq!(stats.closed_loans + stats.open_loans, store.all_loans().len());
}

#[test]
fn reopened_store_replays_the_same_state() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FixedClock::new(start_date()));

    let (copies_before, loans_before) = {
        let store = open_store(&dir);
        store.add_copies("Emma", "Jane Austen", Some("Fiction"), 3).unwrap();
        store
            .add_copy(NewCopy::new("ref-1", "Oxford Dictionary", "OUP").with_category("Reference"))
            .unwrap();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&clock));

        engine.issue_book(&CopyId::new("1"), &MemberId::new("m1")).unwrap();
        engine.issue_book(&CopyId::new("2"), &MemberId::new("m2")).unwrap();
        clock.advance_days(30);
        engine.return_book(&CopyId::new("1")).unwrap();
        engine.issue_book(&CopyId::new("1"), &MemberId::new("m3")).unwrap();

        let snapshot = (store.list_copies(), store.all_loans());
        store.close().unwrap();
        snapshot
    };

    let store = open_store(&dir);
    assert_eq!(store.list_copies(), copies_before);
    assert_eq!(store.all_loans(), loans_before);
    assert_consistent(&store);

    let closed: Vec<_> = loans_before.iter().filter(|l| !l.is_open()).collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].fine, Money::from_units(150));

    // The replayed store keeps accepting work.
    let engine = engine_for(Arc::clone(&store), clock);
    let receipt = engine.issue_book(&CopyId::new("3"), &MemberId::new("m4")).unwrap();
    assert!(loans_before.iter().all(|l| l.id < receipt.loan_id));
}
