use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use ulid::Ulid;

use lodgebook::engine::{ConflictDetail, Engine, EngineError};
use lodgebook::model::*;
use lodgebook::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lodgebook_int_test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Arc<Engine> {
    Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap())
}

fn request(resource_id: Ulid, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        resource_id,
        start,
        end,
        requester_id: Ulid::new(),
        amount: None,
        label: None,
    }
}

/// Approve every booking at once from separate tasks.
async fn approve_all(engine: &Arc<Engine>, ids: &[Ulid]) -> Vec<Result<Booking, EngineError>> {
    let handles = ids.iter().map(|&id| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.approve(id).await })
    });
    join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

// ── Exclusive resources ──────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_approvals_leave_one_winner() {
    let engine = open(&test_wal_path("one_winner"));
    let hall = Ulid::new();
    engine
        .create_resource(hall, Some("Hall".into()), ResourceKind::Exclusive)
        .await
        .unwrap();

    // Every window covers t=50.
    let mut ids = Vec::new();
    for i in 0..32 {
        let b = engine
            .create_booking(request(hall, i, 100 + i))
            .await
            .unwrap();
        ids.push(b.id);
    }

    let results = approve_all(&engine, &ids).await;
    let winners: Vec<&Booking> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for r in &results {
        if let Err(e) = r {
            assert!(matches!(
                e,
                EngineError::Conflict(ConflictDetail::Booking(id)) if *id == winners[0].id
            ));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approved_windows_never_overlap() {
    let engine = open(&test_wal_path("no_overlap"));
    let hall = Ulid::new();
    engine
        .create_resource(hall, None, ResourceKind::Exclusive)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..40 {
        let start = (i * 37) % 400;
        let b = engine
            .create_booking(request(hall, start, start + 25 + (i % 5) * 10))
            .await
            .unwrap();
        ids.push(b.id);
    }
    let results = approve_all(&engine, &ids).await;
    assert!(results.iter().any(|r| r.is_ok()));

    let held = engine
        .list_bookings(Some(hall), Some(BookingStatus::Approved))
        .await;
    for (i, a) in held.iter().enumerate() {
        for b in &held[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_booking_ids_create_once() {
    let engine = open(&test_wal_path("dup_booking"));
    let hall = Ulid::new();
    engine
        .create_resource(hall, None, ResourceKind::Exclusive)
        .await
        .unwrap();

    for round in 0..50 {
        let req = request(hall, round * 10, round * 10 + 5);
        let handles = (0..16).map(|_| {
            let engine = engine.clone();
            let req = req.clone();
            tokio::spawn(async move { engine.create_booking(req).await })
        });
        let results: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for r in &results {
            if let Err(e) = r {
                assert!(matches!(e, EngineError::AlreadyExists(id) if *id == req.id));
            }
        }
    }
    assert_eq!(engine.list_bookings(Some(hall), None).await.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_resource_ids_create_once() {
    let engine = open(&test_wal_path("dup_resource"));
    for _ in 0..50 {
        let id = Ulid::new();
        let handles = (0..16u32).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_resource(id, None, ResourceKind::Pooled { total_stock: i + 1 })
                    .await
            })
        });
        let results: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(()) | Err(EngineError::AlreadyExists(_)))));
    }
    assert_eq!(engine.list_resources().await.len(), 50);
}

/// One task creates and approves a booking on hall A while another tries to
/// create the same id on hall B. Whichever wins, cancelling it frees both.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_approve_race_holds_only_the_stored_booking() {
    let engine = open(&test_wal_path("create_approve"));
    let hall_a = Ulid::new();
    let hall_b = Ulid::new();
    for hall in [hall_a, hall_b] {
        engine
            .create_resource(hall, None, ResourceKind::Exclusive)
            .await
            .unwrap();
    }

    for round in 0..100 {
        let start = round * 100;
        let on_a = request(hall_a, start, start + 50);
        let on_b = BookingRequest {
            resource_id: hall_b,
            ..on_a.clone()
        };
        let id = on_a.id;

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                if engine.create_booking(on_a).await.is_ok() {
                    let _ = engine.approve(id).await;
                }
            })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = engine.create_booking(on_b).await;
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        let stored = engine.get_booking(id).await.unwrap();
        if stored.status == BookingStatus::Requested {
            engine.approve(id).await.unwrap();
        }
        engine.cancel(id).await.unwrap();
        for hall in [hall_a, hall_b] {
            let check = engine
                .check_exclusive(hall, start, start + 50, None)
                .await
                .unwrap();
            assert!(check.available, "round {round}: {hall} still held");
        }
    }
}

// ── Pooled items ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_stock_never_oversubscribed() {
    let engine = open(&test_wal_path("pooled_stock"));
    let chairs = Ulid::new();
    let tables = Ulid::new();
    engine
        .create_resource(chairs, None, ResourceKind::Pooled { total_stock: 10 })
        .await
        .unwrap();
    engine
        .create_resource(tables, None, ResourceKind::Pooled { total_stock: 3 })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..40u32 {
        let start = (i as Ms % 8) * 10;
        let mut lines = vec![LoanLine { item_id: chairs, quantity: 1 + i % 4 }];
        if i % 3 == 0 {
            lines.push(LoanLine { item_id: tables, quantity: 1 });
        }
        let b = engine
            .create_pooled_booking(PooledBookingRequest {
                id: Ulid::new(),
                lines,
                start,
                end: start + 30,
                requester_id: Ulid::new(),
                amount: None,
                label: None,
            })
            .await
            .unwrap();
        ids.push(b.id);
    }

    let results = approve_all(&engine, &ids).await;
    for r in &results {
        if let Err(e) = r {
            assert!(matches!(e, EngineError::Conflict(ConflictDetail::Shortfalls(_))));
        }
    }

    for item in [chairs, tables] {
        let profile = engine.stock_profile(item, 0, 200).await.unwrap();
        assert!(profile.iter().all(|level| level.available >= 0), "{profile:?}");
    }
}

// ── Counters ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_next_issues_contiguous_values() {
    let engine = open(&test_wal_path("counter_contiguous"));
    engine.counter_set("receipt", 5).await.unwrap();

    let handles = (0..100).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.counter_next("receipt").await.unwrap() })
    });
    let mut issued: Vec<u64> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    issued.sort();
    assert_eq!(issued, (6..=105).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_under_load_loses_nothing() {
    let path = test_wal_path("compact_load");
    let engine = open(&path);

    let writers = (0..4).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                engine.counter_next("ticket").await.unwrap();
            }
        })
    });
    let compactor = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                engine.compact_wal().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for h in join_all(writers).await {
        h.unwrap();
    }
    compactor.await.unwrap();
    drop(engine);

    let engine = open(&path);
    assert_eq!(engine.counter_current("ticket").await, Some(200));
}

// ── Rotation ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_serve_each_entry_once() {
    let engine = open(&test_wal_path("rotation"));
    let mut entries = HashSet::new();
    for name in ["Ana", "Ben", "Cleo", "Dev", "Emil", "Flo", "Gita", "Hugo"] {
        let participant = Ulid::new();
        engine
            .register_participant(participant, name.into())
            .await
            .unwrap();
        let entry = Ulid::new();
        engine.add_roster_entry(entry, participant).await.unwrap();
        entries.insert(entry);
    }

    let handles = (0..entries.len()).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.advance().await.unwrap().unwrap() })
    });
    let served: HashSet<Ulid> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().roster_entry_id)
        .collect();
    assert_eq!(served, entries);
}
