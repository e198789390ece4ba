//! Integration tests for trigger scheduling and the task lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{
    load_collection_trigger, load_segments_trigger, AckNode, FailingNode, GatedNode,
};
use common::{fast_config, wait_until, TestCoord};
use meridian_kv::MetaKv;
use meridian_proto::NodeRequest;
use meridian_querycoord::{
    TaskOutcome, TaskState, ACTIVE_TASK_PREFIX, TASK_INFO_PREFIX, TRIGGER_TASK_PREFIX,
};

#[tokio::test]
async fn load_collection_fans_out_and_cleans_up() {
    let coord = TestCoord::new();
    coord.seed_collection();
    let node1 = AckNode::new();
    let node2 = AckNode::new();
    coord.cluster.register_node(1, node1.clone());
    coord.cluster.register_node(2, node2.clone());
    coord.scheduler.start();

    let trigger = load_collection_trigger(coord.scheduler.cancellation_token(), 1);
    coord.scheduler.enqueue(Arc::clone(&trigger)).await.unwrap();

    let outcome = trigger.base().condition().wait().await.unwrap();
    assert_eq!(outcome, TaskOutcome::Success);

    // the whole task tree is gone from the store
    assert!(coord
        .kv
        .load_with_prefix(TRIGGER_TASK_PREFIX)
        .await
        .unwrap()
        .is_empty());
    assert!(coord
        .kv
        .load_with_prefix(ACTIVE_TASK_PREFIX)
        .await
        .unwrap()
        .is_empty());
    assert!(coord
        .kv
        .load_with_prefix(TASK_INFO_PREFIX)
        .await
        .unwrap()
        .is_empty());

    // the fan-out reached the workers
    let all: Vec<NodeRequest> = node1
        .requests()
        .into_iter()
        .chain(node2.requests())
        .collect();
    assert!(all
        .iter()
        .any(|r| matches!(r, NodeRequest::LoadSegments(_))));
    assert!(all
        .iter()
        .any(|r| matches!(r, NodeRequest::WatchDmChannels(_))));
    assert!(all
        .iter()
        .any(|r| matches!(r, NodeRequest::AddQueryChannel(_))));

    // load state was recorded for every segment
    assert_eq!(coord.meta.loaded_segment_count(), 3);

    coord.scheduler.close().await;
}

#[tokio::test]
async fn triggers_dispatch_in_fifo_order() {
    let coord = TestCoord::new();
    coord.seed_collection();
    let node = AckNode::new();
    coord.cluster.register_node(1, node.clone());
    coord.scheduler.start();

    let cancel = coord.scheduler.cancellation_token();
    let first = load_collection_trigger(cancel.clone(), 1);
    let second = load_segments_trigger(cancel, 2, 999, None);
    coord.scheduler.enqueue(Arc::clone(&first)).await.unwrap();
    coord.scheduler.enqueue(Arc::clone(&second)).await.unwrap();

    assert_eq!(
        first.base().condition().wait().await.unwrap(),
        TaskOutcome::Success
    );
    assert_eq!(
        second.base().condition().wait().await.unwrap(),
        TaskOutcome::Success
    );

    // the stand-alone segment load arrives after the whole collection fan-out
    let requests = node.requests();
    let position = requests
        .iter()
        .position(|r| matches!(r, NodeRequest::LoadSegments(req) if req.segment_ids == vec![999]))
        .expect("solo segment load should reach the worker");
    assert_eq!(position, requests.len() - 1);

    coord.scheduler.close().await;
}

#[tokio::test]
async fn enqueue_is_durable_before_dispatch() {
    let coord = TestCoord::new();
    coord.seed_collection();
    coord.cluster.register_node(1, AckNode::new());

    // scheduler not started: the trigger is persisted but not dispatched
    let trigger = load_collection_trigger(coord.scheduler.cancellation_token(), 1);
    let id = coord.scheduler.enqueue(Arc::clone(&trigger)).await.unwrap();

    let triggers = coord
        .kv
        .load_with_prefix(TRIGGER_TASK_PREFIX)
        .await
        .unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].0, format!("{TRIGGER_TASK_PREFIX}/{id}"));
    assert_eq!(trigger.base().state(), TaskState::Unissued);

    coord.scheduler.start();
    assert_eq!(
        trigger.base().condition().wait().await.unwrap(),
        TaskOutcome::Success
    );
    assert!(coord
        .kv
        .load_with_prefix(TRIGGER_TASK_PREFIX)
        .await
        .unwrap()
        .is_empty());
    assert!(coord
        .kv
        .load_with_prefix(ACTIVE_TASK_PREFIX)
        .await
        .unwrap()
        .is_empty());

    coord.scheduler.close().await;
}

#[tokio::test]
async fn worker_rpc_failures_fail_the_parent_and_clean_up() {
    let mut config = fast_config();
    config.cleanup.failed_task_grace = Duration::from_millis(300);
    let coord = TestCoord::with_config(config);
    coord.cluster.register_node(1, Arc::new(FailingNode));
    coord.scheduler.start();

    let trigger = load_segments_trigger(coord.scheduler.cancellation_token(), 1, 100, Some(1));
    let id = coord.scheduler.enqueue(Arc::clone(&trigger)).await.unwrap();

    let outcome = trigger.base().condition().wait().await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Failed(_)));

    // the failed state stays readable during the grace period
    let state = coord
        .kv
        .load(&format!("{TASK_INFO_PREFIX}/{id}"))
        .await
        .unwrap()
        .expect("failed state should be readable");
    assert_eq!(state, b"4".to_vec());

    // then the whole tree is removed
    assert!(
        wait_until(Duration::from_secs(2), || async {
            coord
                .kv
                .load_with_prefix(TASK_INFO_PREFIX)
                .await
                .unwrap()
                .is_empty()
        })
        .await
    );

    coord.scheduler.close().await;
}

#[tokio::test]
async fn parent_completes_only_after_children() {
    let coord = TestCoord::new();
    let gate = GatedNode::new();
    coord.cluster.register_node(1, gate.clone());
    coord.scheduler.start();

    let trigger = load_segments_trigger(coord.scheduler.cancellation_token(), 1, 100, Some(1));
    coord.scheduler.enqueue(Arc::clone(&trigger)).await.unwrap();

    // the child is held at the worker; the parent must still be in flight
    assert!(
        wait_until(Duration::from_secs(2), || async {
            !coord
                .kv
                .load_with_prefix(ACTIVE_TASK_PREFIX)
                .await
                .unwrap()
                .is_empty()
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(trigger.base().condition().outcome(), None);
    assert_eq!(trigger.base().state(), TaskState::Doing);

    gate.open();
    assert_eq!(
        trigger.base().condition().wait().await.unwrap(),
        TaskOutcome::Success
    );

    coord.scheduler.close().await;
}

#[tokio::test]
async fn wait_for_workers_blocks_until_registration() {
    let coord = TestCoord::new();

    let waiter = {
        let scheduler = Arc::clone(&coord.scheduler);
        tokio::spawn(async move { scheduler.wait_for_workers().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    coord.cluster.register_node(1, AckNode::new());
    waiter.await.unwrap().unwrap();

    coord.scheduler.close().await;
}
