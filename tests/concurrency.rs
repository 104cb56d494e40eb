mod common;

use std::sync::Arc;

use futures::future::join_all;
use proptest::prelude::*;
use ulid::Ulid;

use roomkeeper::config::BookingPolicy;
use roomkeeper::engine::*;
use roomkeeper::model::*;

use common::{day, slot, test_wal_path};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_requests_for_one_slot_admit_one() {
    let engine = Arc::new(Engine::new(test_wal_path("race_one.wal"), BookingPolicy::default()).unwrap());
    let room = Ulid::new();
    engine.register_room(room, None, 10, true).await.unwrap();

    let attempts = (0..32).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .request_booking(BookingRequest::new(Ulid::new(), room, slot(10, 11), format!("Racer {i}")))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(result, SchedulingError::Conflict { .. }));
    }
    assert_eq!(engine.list_bookings(&room, false).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_overlapping_requests_never_double_book() {
    let engine = Arc::new(Engine::new(test_wal_path("race_overlap.wal"), BookingPolicy::default()).unwrap());
    let room = Ulid::new();
    engine.register_room(room, None, 10, true).await.unwrap();

    // Staggered half-hour offsets: every pair of neighbours overlaps.
    let attempts = (0..24).map(|i| {
        let engine = engine.clone();
        let start = day() + 8 * HOUR_MS + i * 30 * MINUTE_MS;
        tokio::spawn(async move {
            engine
                .request_booking(BookingRequest::new(
                    Ulid::new(),
                    room,
                    Interval::new(start, start + HOUR_MS),
                    "Overlap",
                ))
                .await
        })
    });
    for result in join_all(attempts).await {
        let _ = result.unwrap();
    }

    let confirmed = engine.list_bookings(&room, false).await.unwrap();
    assert!(!confirmed.is_empty());
    for pair in confirmed.windows(2) {
        assert!(
            !pair[0].interval.overlaps(&pair[1].interval),
            "{:?} overlaps {:?}",
            pair[0].interval,
            pair[1].interval
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_and_rebook_race_keeps_one_holder() {
    let engine = Arc::new(Engine::new(test_wal_path("race_rebook.wal"), BookingPolicy::default()).unwrap());
    let room = Ulid::new();
    engine.register_room(room, None, 10, true).await.unwrap();
    let owner = Ulid::new();
    let held = engine
        .request_booking(BookingRequest::new(owner, room, slot(10, 11), "Held"))
        .await
        .unwrap()
        .booking;

    let cancel = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cancel_booking(held.id, Actor::user(owner)).await })
    };
    let rebookers = (0..8).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .request_booking(BookingRequest::new(Ulid::new(), room, slot(10, 11), "Grab"))
                .await
        })
    });
    let rebooked = join_all(rebookers).await;
    cancel.await.unwrap().unwrap();

    let winners = rebooked.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert!(winners <= 1);
    let confirmed = engine.list_bookings(&room, false).await.unwrap();
    assert_eq!(confirmed.len(), winners);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rooms_are_independent_under_load() {
    let engine = Arc::new(Engine::new(test_wal_path("race_rooms.wal"), BookingPolicy::default()).unwrap());
    let rooms: Vec<Ulid> = (0..8).map(|_| Ulid::new()).collect();
    for &room in &rooms {
        engine.register_room(room, None, 10, true).await.unwrap();
    }

    let attempts = rooms.iter().flat_map(|&room| {
        let engine = engine.clone();
        (0..4).map(move |_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .request_booking(BookingRequest::new(Ulid::new(), room, slot(10, 11), "Busy"))
                    .await
            })
        })
    });
    let winners = join_all(attempts)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(winners, rooms.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever sequence of requests and cancellations arrives, confirmed
    /// bookings in a room never overlap and the slot index agrees with them.
    #[test]
    fn confirmed_bookings_never_overlap(
        ops in prop::collection::vec((0i64..28, 1i64..6, any::<bool>()), 1..40)
    ) {
        tokio_test::block_on(async {
            let path = test_wal_path(&format!("prop_{}.wal", Ulid::new()));
            let engine = Engine::new(path.clone(), BookingPolicy::default()).unwrap();
            let room = Ulid::new();
            let owner = Ulid::new();
            engine.register_room(room, None, 10, true).await.unwrap();

            let mut live: Vec<Ulid> = Vec::new();
            for (offset, quarters, cancel) in ops {
                if cancel && !live.is_empty() {
                    let id = live.remove(offset as usize % live.len());
                    engine.cancel_booking(id, Actor::user(owner)).await.unwrap();
                    continue;
                }
                let start = day() + 8 * HOUR_MS + offset * 15 * MINUTE_MS;
                let interval = Interval::new(start, start + quarters * 15 * MINUTE_MS);
                let request = BookingRequest::new(owner, room, interval, "Prop");
                match engine.request_booking(request).await {
                    Ok(created) => live.push(created.booking.id),
                    Err(e) => assert!(matches!(e, SchedulingError::Conflict { .. }), "{e}"),
                }
            }

            let confirmed = engine.list_bookings(&room, false).await.unwrap();
            assert_eq!(confirmed.len(), live.len());
            for (i, a) in confirmed.iter().enumerate() {
                for b in &confirmed[i + 1..] {
                    assert!(!a.interval.overlaps(&b.interval));
                }
                assert!(engine.has_conflict(&room, &a.interval, None).await);
                assert!(!engine.has_conflict(&room, &a.interval, Some(a.id)).await);
            }
            let _ = std::fs::remove_file(path);
        });
    }
}
