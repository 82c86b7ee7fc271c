//! End-to-end request scenarios against an in-process service.
//!
//! Run with: `cargo test --test scenarios`

mod common;

use std::time::{Duration, Instant};

use chrono::Utc;

use concache::{CalcState, ConcRequest, Corpus, MinSize};

use common::{finished_header, pipeline, FakeEngine, Harness};

const DOG: &str = "q[word=\"dog\"]";
const BARK: &str = "p0 0 1 [lemma=\"bark\"]";
const SLOW: &str = "q[word=\"slow\"]";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_hit_skips_engine() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG]);
    h.preload(&corpus, &q, 1, finished_header(42, 42)).await;

    let handle = h.service.get_conc(&corpus, &ConcRequest::new(q)).await.unwrap();

    assert!(handle.finished());
    assert_eq!(handle.size(), 42);
    assert_eq!(handle.calc_from(), 1);
    assert_eq!(h.engine.compute_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prefix_resume_runs_only_the_suffix() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG, BARK]);
    h.preload(&corpus, &q, 1, finished_header(100, 100)).await;

    let (calc_from, _) = h
        .service
        .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
        .await
        .unwrap();
    assert_eq!(calc_from, 1);

    let handle = h.service.get_conc(&corpus, &ConcRequest::new(q.clone())).await.unwrap();
    assert_eq!(handle.size(), 50);
    assert_eq!(h.engine.compute_calls(), 0);
    assert_eq!(h.engine.exec_calls(), 1);

    let fp = h.fingerprint(&corpus, &q, 2, 0);
    let status = h.service.calc_status(&corpus, &fp).await.unwrap().unwrap();
    assert_eq!(status.state(), CalcState::Complete);
    assert_eq!(status.concsize, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_computation() {
    let engine = FakeEngine::new().with_query("[word=\"slow\"]", 100, Duration::from_secs(3));
    let h = Harness::new(engine);
    let corpus = Corpus::new("C1", 2_500_000_000);
    let q = pipeline(&["q[word=\"slow\"]"]);
    let req = ConcRequest::new(q.clone());

    let (first, second) = tokio::join!(
        h.service.get_conc(&corpus, &req),
        h.service.get_conc(&corpus, &req)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.is_in_progress());
    assert!(second.is_in_progress());
    assert_eq!(first.cachefile(), second.cachefile());
    assert_eq!(h.engine.compute_calls(), 1);

    let fp = h.fingerprint(&corpus, &q, 1, 0);
    assert_eq!(first.fingerprint(), Some(&fp));
    let entries = h.service.context().cache_map(&corpus).entries().await.unwrap();
    assert_eq!(entries.len(), 1);

    assert!(h.service.wait_for_conc(&corpus, &fp, MinSize::Complete).await.unwrap());
    let status = h.service.calc_status(&corpus, &fp).await.unwrap().unwrap();
    assert!(status.finished);
    assert_eq!(status.concsize, 100);

    let a = h.service.get_conc(&corpus, &req).await.unwrap();
    let b = h.service.get_conc(&corpus, &req).await.unwrap();
    assert_eq!(a.size(), 100);
    assert_eq!(b.size(), 100);
    assert_eq!(h.engine.compute_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_entry_times_out_and_is_recomputed() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG]);
    let map = h.service.context().cache_map(&corpus);
    let fp = map.fingerprint(q.ops(), 0);

    let mut status = concache::CalcStatus::new().with_task_id("task-gone");
    status.last_upd = Utc::now() - chrono::Duration::seconds(600);
    map.ensure_writable_storage().await.unwrap();
    map.add_to_map(&fp, status, false).await.unwrap();

    let mut stored = h.service.calc_status(&corpus, &fp).await.unwrap().unwrap();
    assert!(stored.check_for_errors(h.service.config().task_time_limit));
    assert_eq!(stored.state(), CalcState::Failed);

    let handle = h
        .service
        .get_conc(&corpus, &ConcRequest::new(q).with_async(false))
        .await
        .unwrap();
    assert!(handle.finished());
    assert_eq!(handle.size(), 100);
    assert_eq!(h.engine.compute_calls(), 1);

    let fresh = h.service.calc_status(&corpus, &fp).await.unwrap().unwrap();
    assert!(fresh.error.is_none());
    assert!(fresh.finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aligned_drop_on_large_corpus_goes_to_background() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 80_000_000);
    let q = pipeline(&[DOG, "Xintercorp_en"]);

    let handle = h.service.get_conc(&corpus, &ConcRequest::new(q.clone())).await.unwrap();

    let root = h.fingerprint(&corpus, &q, 1, 0);
    let full = h.fingerprint(&corpus, &q, 2, 0);
    assert!(handle.is_in_progress());
    assert_eq!(handle.fingerprint(), Some(&full));
    assert_eq!(handle.calc_from(), 0);

    for fp in [&root, &full] {
        let status = h.service.calc_status(&corpus, fp).await.unwrap().unwrap();
        assert!(status.task_id.is_some());
    }

    assert!(h.service.wait_for_conc(&corpus, &full, MinSize::Complete).await.unwrap());
    let status = h.service.calc_status(&corpus, &full).await.unwrap().unwrap();
    assert_eq!(status.concsize, 100);
    assert_eq!(h.engine.compute_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entry_older_than_corpus_index_is_invalidated() {
    let h = Harness::new(FakeEngine::new());
    let plain = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG]);
    let (fp, path) = h.preload(&plain, &q, 1, finished_header(42, 42)).await;

    let map = h.service.context().cache_map(&plain);
    let mut status = map.get_calc_status(&fp).await.unwrap().unwrap();
    status.created = Utc::now() - chrono::Duration::hours(1);
    assert!(map.store_calc_status(&fp, &status).await.unwrap());

    let index = h.dir.path().join("C1.index");
    std::fs::write(&index, b"rebuilt").unwrap();
    let indexed = plain.clone().with_index_path(&index);

    let (calc_from, handle) = h
        .service
        .find_cached_conc_base(&indexed, &q, 0, MinSize::Complete)
        .await
        .unwrap();
    assert_eq!(calc_from, 0);
    assert_eq!(handle.size(), 0);
    assert!(h.service.calc_status(&plain, &fp).await.unwrap().is_none());
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_extending_in_flight_background_pipeline() {
    let engine = FakeEngine::new().with_query("[word=\"slow\"]", 100, Duration::from_secs(1));
    let h = Harness::new(engine);
    let corpus = Corpus::new("C1", 2_500_000_000);
    let short = pipeline(&[SLOW, "Xintercorp_en"]);
    let long = pipeline(&[SLOW, "Xintercorp_en", "s word/ 0"]);

    let first = h.service.get_conc(&corpus, &ConcRequest::new(short.clone())).await.unwrap();
    assert!(first.is_in_progress());
    let second = h.service.get_conc(&corpus, &ConcRequest::new(long.clone())).await.unwrap();
    assert!(second.is_in_progress());

    let last = h.fingerprint(&corpus, &long, 3, 0);
    assert_eq!(second.fingerprint(), Some(&last));
    let status = h.service.calc_status(&corpus, &last).await.unwrap().unwrap();
    assert!(status.task_id.is_some());

    assert!(h.service.wait_for_conc(&corpus, &last, MinSize::Complete).await.unwrap());
    let status = h.service.calc_status(&corpus, &last).await.unwrap().unwrap();
    assert_eq!(status.state(), CalcState::Complete);
    assert_eq!(status.concsize, 100);

    let shared = h.fingerprint(&corpus, &short, 2, 0);
    assert!(h.service.wait_for_conc(&corpus, &shared, MinSize::Complete).await.unwrap());
    assert_eq!(h.engine.compute_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_request_releases_its_lock() {
    let engine = FakeEngine::new().with_query("[word=\"slow\"]", 100, Duration::from_millis(600));
    let h = Harness::new(engine);
    let corpus = Corpus::new("C1", 1_000_000);
    let req = ConcRequest::new(pipeline(&[SLOW])).with_async(false);

    let dropped = tokio::time::timeout(Duration::from_millis(100), h.service.get_conc(&corpus, &req)).await;
    assert!(dropped.is_err());
    tokio::time::sleep(Duration::from_millis(800)).await;

    let started = Instant::now();
    let handle = h.service.get_conc(&corpus, &req).await.unwrap();
    assert!(handle.finished());
    assert_eq!(handle.size(), 100);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.engine.compute_calls(), 2);
}
