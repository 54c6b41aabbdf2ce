//! Deferral tests: what gets queued, and what a worker gets back out.

use crate::{
    async_trait, batch_handler_fn, handler_fn, DeferQueue, DeferSpec, DeferredInvocation,
    EventName, HandlerOptions, Matcher, RecordChange, RouterBuilder, RouterConfig, RouterError,
    StreamEvent, StreamRecord, Value, DEFAULT_DEFER_QUEUE,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Mock Defer Queue
// ============================================================================

#[derive(Clone, Default)]
struct TestDeferQueue {
    enqueued: Arc<Mutex<Vec<(DeferSpec, serde_json::Value)>>>,
    scheduled: Arc<Mutex<Vec<(DeferSpec, serde_json::Value, DateTime<Utc>)>>>,
    reject: bool,
}

impl TestDeferQueue {
    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    fn get_enqueued(&self) -> Vec<(DeferSpec, serde_json::Value)> {
        self.enqueued.lock().unwrap().clone()
    }

    fn get_scheduled(&self) -> Vec<(DeferSpec, serde_json::Value, DateTime<Utc>)> {
        self.scheduled.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeferQueue for TestDeferQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: DeferSpec) -> Result<Uuid> {
        if self.reject {
            anyhow::bail!("queue is full");
        }
        self.enqueued.lock().unwrap().push((spec, payload));
        Ok(Uuid::new_v4())
    }

    async fn schedule(
        &self,
        payload: serde_json::Value,
        spec: DeferSpec,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        if self.reject {
            anyhow::bail!("queue is full");
        }
        self.scheduled.lock().unwrap().push((spec, payload, run_at));
        Ok(Uuid::new_v4())
    }
}

fn tagged_insert(seq: &str) -> StreamRecord {
    serde_json::from_value(json!({
        "eventID": seq,
        "eventName": "INSERT",
        "dynamodb": {
            "Keys": {"pk": {"S": format!("post#{seq}")}},
            "NewImage": {
                "pk": {"S": format!("post#{seq}")},
                "tags": {"SS": ["rust", "streams"]},
                "scores": {"NS": ["1", "2.5"]}
            },
            "SequenceNumber": seq
        }
    }))
    .unwrap()
}

fn counting_handler(counter: Arc<Mutex<Vec<RecordChange>>>) -> impl crate::RecordHandler {
    handler_fn(move |change: RecordChange| {
        let counter = counter.clone();
        async move {
            counter.lock().unwrap().push(change);
            anyhow::Ok(())
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn deferred_handler_is_queued_not_run() {
    let queue = TestDeferQueue::default();
    let ran: Arc<Mutex<Vec<RecordChange>>> = Arc::default();
    let router = RouterBuilder::new(RouterConfig::default())
        .with_defer_queue(Arc::new(queue.clone()))
        .on_insert_with(
            Matcher::any(),
            counting_handler(ran.clone()),
            HandlerOptions::new()
                .id("index-post")
                .deferred(DeferSpec::new().with_priority(5)),
        )
        .build()
        .unwrap();

    let outcome = router
        .process(&StreamEvent::new(vec![tagged_insert("1")]))
        .await
        .unwrap();

    assert!(ran.lock().unwrap().is_empty());
    assert_eq!(outcome.deferred, 1);
    assert_eq!(outcome.invocations, 0);

    let enqueued = queue.get_enqueued();
    assert_eq!(enqueued.len(), 1);
    let (spec, payload) = &enqueued[0];
    assert_eq!(spec.queue.as_deref(), Some(DEFAULT_DEFER_QUEUE));
    assert_eq!(spec.priority, 5);
    assert_eq!(payload["handler_id"], "index-post");
    assert_eq!(payload["records"][0]["dynamodb"]["SequenceNumber"], "1");
}

#[tokio::test]
async fn delayed_handlers_are_scheduled() {
    let queue = TestDeferQueue::default();
    let router = RouterBuilder::new(RouterConfig::default().with_default_defer_queue("slow-lane"))
        .with_defer_queue(Arc::new(queue.clone()))
        .on_insert_with(
            Matcher::any(),
            counting_handler(Arc::default()),
            HandlerOptions::new().deferred(DeferSpec::new().with_delay(Duration::from_secs(60))),
        )
        .build()
        .unwrap();

    let before = Utc::now();
    router
        .process(&StreamEvent::new(vec![tagged_insert("1")]))
        .await
        .unwrap();

    assert!(queue.get_enqueued().is_empty());
    let scheduled = queue.get_scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].0.queue.as_deref(), Some("slow-lane"));
    assert!(scheduled[0].2 >= before + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn worker_round_trip_preserves_typed_sets() {
    let queue = TestDeferQueue::default();
    let ran: Arc<Mutex<Vec<RecordChange>>> = Arc::default();
    let router = RouterBuilder::new(RouterConfig::default())
        .with_defer_queue(Arc::new(queue.clone()))
        .on_insert_with(
            Matcher::any(),
            counting_handler(ran.clone()),
            HandlerOptions::new().id("index-post").deferred(DeferSpec::new()),
        )
        .build()
        .unwrap();

    router
        .process(&StreamEvent::new(vec![tagged_insert("1"), tagged_insert("2")]))
        .await
        .unwrap();

    for (_, payload) in queue.get_enqueued() {
        router.process_deferred(payload).await.unwrap();
    }

    let ran = ran.lock().unwrap();
    assert_eq!(ran.len(), 2);
    let image = ran[0].new.as_ref().unwrap();
    assert_eq!(
        image.get_path("tags"),
        Some(&Value::set(["rust", "streams"].map(Value::from)))
    );
    assert_eq!(image.get_path("scores"), Some(&Value::set([1.0, 2.5].map(Value::from))));
}

#[tokio::test]
async fn deferred_batch_handlers_queue_one_job_per_group() {
    let queue = TestDeferQueue::default();
    let batches: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = batches.clone();
    let router = RouterBuilder::new(RouterConfig::default())
        .with_defer_queue(Arc::new(queue.clone()))
        .on_batch(
            &[EventName::Insert],
            Matcher::any(),
            batch_handler_fn(move |changes: Vec<RecordChange>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(changes.len());
                    anyhow::Ok(())
                }
            }),
            HandlerOptions::new().id("reindex").deferred(DeferSpec::new()),
        )
        .build()
        .unwrap();

    let outcome = router
        .process(&StreamEvent::new(vec![tagged_insert("1"), tagged_insert("2")]))
        .await
        .unwrap();
    assert_eq!(outcome.deferred, 1);

    let enqueued = queue.get_enqueued();
    assert_eq!(enqueued.len(), 1);
    let invocation: DeferredInvocation = serde_json::from_value(enqueued[0].1.clone()).unwrap();
    assert_eq!(invocation.records.len(), 2);

    router.process_deferred(enqueued[0].1.clone()).await.unwrap();
    assert_eq!(*batches.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn unknown_handler_ids_are_rejected() {
    let router = RouterBuilder::new(RouterConfig::default()).build().unwrap();
    let payload = serde_json::to_value(DeferredInvocation {
        handler_id: "gone".into(),
        records: vec![tagged_insert("1")],
    })
    .unwrap();

    let err = router.process_deferred(payload).await.unwrap_err();
    assert!(matches!(err, RouterError::UnknownHandler(id) if id == "gone"));
}

#[tokio::test]
async fn malformed_payloads_are_rejected() {
    let router = RouterBuilder::new(RouterConfig::default()).build().unwrap();
    let err = router
        .process_deferred(json!({"handler_id": 7}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Payload(_)));
}

#[tokio::test]
async fn queue_failures_are_reported_against_the_record() {
    let router = RouterBuilder::new(RouterConfig::default())
        .with_defer_queue(Arc::new(TestDeferQueue::rejecting()))
        .on_insert_with(
            Matcher::any(),
            counting_handler(Arc::default()),
            HandlerOptions::new().id("index-post").deferred(DeferSpec::new()),
        )
        .build()
        .unwrap();

    let outcome = router
        .process(&StreamEvent::new(vec![tagged_insert("1")]))
        .await
        .unwrap();

    assert_eq!(outcome.deferred, 0);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].handler_id.as_deref(), Some("index-post"));
    assert!(outcome.failures[0].error.contains("queue is full"));
}
