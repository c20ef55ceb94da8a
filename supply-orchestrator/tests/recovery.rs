mod common;

use std::sync::Arc;

use common::{harness, Harness, STAGING};
use supply_common::{
    ApplyOrder, ApplyStep, DeviceInfo, GenerateRecord, GenerateStatus, OrderStatus, ResourceSpec,
    ResourceType, StepName, StepStatus, SuborderRequest, TicketStage,
};
use supply_orchestrator::state_machine;
use supply_orchestrator::store::{DeviceFilter, RecordFilter};
use supply_orchestrator::{Recoverer, Store};
use supply_providers::inventory::HostInfo;
use supply_providers::mock::MockCloud;

fn cvm(replicas: u32) -> SuborderRequest {
    SuborderRequest {
        resource_type: ResourceType::QcloudCvm,
        spec: ResourceSpec {
            region: "gz".into(),
            zone: "gz-1".into(),
            device_type: "S5.LARGE8".into(),
            ..Default::default()
        },
        replicas,
        remark: String::new(),
        enable_disk_check: false,
    }
}

/// Approved order caught by the crash while its Generate step was running.
async fn crashed_while_generating(h: &Harness, replicas: u32) -> ApplyOrder {
    let ids = h.approve(vec![cvm(replicas)]).await;
    assert!(state_machine::lock_for_matching(h.store.as_ref(), &ids[0])
        .await
        .unwrap());
    let mut step = ApplyStep::new(&ids[0], StepName::Generate, replicas);
    step.status = StepStatus::Handling;
    h.store.upsert_step(&step).await.unwrap();
    h.store.get_order(&ids[0]).await.unwrap().unwrap()
}

async fn rows(h: &Harness, suborder_id: &str) -> (usize, usize) {
    let records = h
        .store
        .find_records(&RecordFilter::suborder(suborder_id))
        .await
        .unwrap();
    let devices = h
        .store
        .find_devices(&DeviceFilter::suborder(suborder_id))
        .await
        .unwrap();
    (records.len(), devices.len())
}

/// The record exists but the create call may or may not have reached the cloud.
#[tokio::test(start_paused = true)]
async fn record_without_remote_id_is_suspended() {
    let cloud = Arc::new(MockCloud::new());
    cloud.add_zone("gz", "gz-1", 10, &[]);
    let h = harness(cloud.clone());
    let order = crashed_while_generating(&h, 3).await;
    h.store
        .insert_record(&GenerateRecord::new(40, &order, 3))
        .await
        .unwrap();

    let recoverer = Recoverer::new(h.engine.clone(), 3);
    recoverer.run().await.unwrap();

    let rec = h.store.get_record(40).await.unwrap().unwrap();
    assert_eq!(rec.status, GenerateStatus::Suspend);
    let order = h.store.get_order(&order.suborder_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Terminate);
    assert!(order.message.contains("suspended"));
    let ticket = h.store.get_ticket(order.order_id).await.unwrap().unwrap();
    assert_eq!(ticket.stage, TicketStage::Terminate);
    assert_eq!(cloud.counters().cvm_create, 0);
    h.assert_invariants().await;
}

/// The remote order finished and its devices were persisted, nothing was delivered yet.
#[tokio::test(start_paused = true)]
async fn finished_batch_is_delivered_without_calling_the_cloud() {
    let cloud = Arc::new(MockCloud::new());
    let h = harness(cloud.clone());
    let order = crashed_while_generating(&h, 2).await;

    let mut rec = GenerateRecord::new(41, &order, 2);
    rec.task_id = "cvm-old".into();
    h.store.insert_record(&rec).await.unwrap();
    rec.status = GenerateStatus::Success;
    let mut devices = Vec::new();
    for n in 1..=2 {
        let ip = format!("10.0.9.{}", n);
        let asset = format!("TC-OLD-{}", n);
        cloud.add_cmdb_host(HostInfo {
            asset_id: asset.clone(),
            ip: ip.clone(),
            bk_biz_id: STAGING,
            zone: "gz-1".into(),
            ..Default::default()
        });
        devices.push(DeviceInfo::new(&order, 41, &ip, &asset));
    }
    h.store.commit_generated(&rec, &devices).await.unwrap();

    let recoverer = Recoverer::new(h.engine.clone(), 3);
    let first = recoverer.run().await.unwrap();
    assert_eq!(first.orders_recovered, 1);
    assert_eq!(first.failed, 0);

    let stored = h.store.get_order(&order.suborder_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Done);
    assert_eq!(stored.success_num, 2);
    assert!(h.store.get_record(41).await.unwrap().unwrap().is_matched);
    assert_eq!(cloud.counters().cvm_create, 0);
    h.assert_invariants().await;
}

/// A second pass over the same state changes nothing and calls nothing.
#[tokio::test(start_paused = true)]
async fn recovery_is_idempotent() {
    let cloud = Arc::new(MockCloud::new());
    cloud.add_zone("gz", "gz-1", 10, &[]);
    let h = harness(cloud.clone());

    // one order frozen mid-generation, one that never started
    let stuck = crashed_while_generating(&h, 2).await;
    h.store
        .insert_record(&GenerateRecord::new(50, &stuck, 2))
        .await
        .unwrap();
    let fresh = h.approve(vec![cvm(1)]).await;
    assert!(state_machine::lock_for_matching(h.store.as_ref(), &fresh[0])
        .await
        .unwrap());

    let recoverer = Recoverer::new(h.engine.clone(), 3);
    recoverer.run().await.unwrap();
    let rows_after_first = (
        rows(&h, &stuck.suborder_id).await,
        rows(&h, &fresh[0]).await,
    );
    let calls_after_first = cloud.counters();
    let fresh_status = h.store.get_order(&fresh[0]).await.unwrap().unwrap().status;
    assert_eq!(fresh_status, OrderStatus::WaitForMatch);

    let second = recoverer.run().await.unwrap();
    assert_eq!(second.orders_recovered, 0);
    assert_eq!(
        (
            rows(&h, &stuck.suborder_id).await,
            rows(&h, &fresh[0]).await
        ),
        rows_after_first
    );
    assert_eq!(cloud.counters(), calls_after_first);
    assert_eq!(calls_after_first.cvm_create, 0);
    h.assert_invariants().await;
}
