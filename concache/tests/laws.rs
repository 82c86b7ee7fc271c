//! Properties that hold for any sequence of requests.
//!
//! Run with: `cargo test --test laws`

mod common;

use std::time::Duration;

use concache::{ConcHandle, ConcRequest, Corpus, MinSize, Pipeline};

use common::{pipeline, FakeEngine, Harness};

const DOG: &str = "q[word=\"dog\"]";
const SLOW: &str = "q[word=\"slow\"]";

fn sync_request(q: &Pipeline) -> ConcRequest {
    ConcRequest::new(q.clone()).with_async(false)
}

async fn finished(h: &Harness, corpus: &Corpus, req: &ConcRequest) -> ConcHandle {
    let handle = h.service.get_conc(corpus, req).await.unwrap();
    assert!(handle.finished(), "expected a finished handle for {}", req.q);
    handle
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_request_is_idempotent() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG, "r10", "s word/ 0"]);

    let first = finished(&h, &corpus, &sync_request(&q)).await;
    let second = finished(&h, &corpus, &sync_request(&q)).await;

    assert_eq!(first.size(), second.size());
    assert_eq!(first.cachefile(), second.cachefile());
    assert_eq!(second.calc_from(), q.len());
    assert_eq!(h.engine.compute_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipelines_share_their_common_prefix() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);

    finished(&h, &corpus, &sync_request(&pipeline(&[DOG, "r10"]))).await;
    let filtered = finished(
        &h,
        &corpus,
        &sync_request(&pipeline(&[DOG, "p0 0 1 [lemma=\"bark\"]"])),
    )
    .await;

    assert_eq!(filtered.size(), 50);
    assert_eq!(h.engine.compute_calls(), 1);
    assert_eq!(h.engine.exec_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_then_request_recomputes() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG]);

    let handle = finished(&h, &corpus, &sync_request(&q)).await;
    let fp = handle.fingerprint().cloned().unwrap();
    let path = handle.cachefile().unwrap().to_path_buf();
    assert!(path.exists());

    h.service.cancel_conc_task(&corpus, &fp).await.unwrap();
    assert!(h.service.calc_status(&corpus, &fp).await.unwrap().is_none());
    assert!(!path.exists());

    // cancelling twice is a no-op
    h.service.cancel_conc_task(&corpus, &fp).await.unwrap();

    finished(&h, &corpus, &sync_request(&q)).await;
    assert_eq!(h.engine.compute_calls(), 2);
}

#[tokio::test]
async fn test_empty_pipeline_yields_empty_finished_handle() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);

    let handle = finished(&h, &corpus, &ConcRequest::new(Pipeline::default())).await;
    assert_eq!(handle.size(), 0);
    assert_eq!(handle.calc_from(), 0);
    assert_eq!(h.engine.compute_calls(), 0);
    assert!(h.service.context().cache_map(&corpus).entries().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cutoff_caps_lines_and_separates_entries() {
    let h = Harness::new(FakeEngine::new());
    let corpus = Corpus::new("C1", 1_000_000);
    let q = pipeline(&[DOG]);

    let capped = finished(&h, &corpus, &sync_request(&q).with_cutoff(30)).await;
    assert_eq!(capped.size(), 30);
    assert_eq!(capped.fullsize(), 100);

    let (calc_from, _) = h
        .service
        .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
        .await
        .unwrap();
    assert_eq!(calc_from, 0);

    let full = finished(&h, &corpus, &sync_request(&q)).await;
    assert_eq!(full.size(), 100);
    assert_ne!(capped.fingerprint(), full.fingerprint());
    assert_eq!(h.engine.compute_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_requests_compute_shared_prefix_once() {
    let engine = FakeEngine::new().with_query("[word=\"slow\"]", 100, Duration::from_millis(500));
    let h = Harness::new(engine);
    let corpus = Corpus::new("C1", 1_000_000);
    let ten = sync_request(&pipeline(&[SLOW, "r10"]));
    let twenty = sync_request(&pipeline(&[SLOW, "r20"]));

    let (a, b) = tokio::join!(h.service.get_conc(&corpus, &ten), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.service.get_conc(&corpus, &twenty).await
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.finished() && b.finished());
    assert_eq!(a.size(), 10);
    assert_eq!(b.size(), 20);
    assert_eq!(h.engine.compute_calls(), 1);

    let root = h.fingerprint(&corpus, &ten.q, 1, 0);
    let status = h.service.calc_status(&corpus, &root).await.unwrap().unwrap();
    assert!(status.finished);
    assert!(status.error.is_none());
}
