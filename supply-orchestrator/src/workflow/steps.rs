//! Step counters and the final order status, always recomputed from the underlying rows.

use chrono::Utc;
use supply_common::{
    ApplyOrder, ApplyStep, DeviceInfo, GenerateStatus, OrderStatus, RecordStatus, StageKind,
    StepName, StepStatus, TicketStage,
};

use crate::error::{OrchestratorError, Result};
use crate::store::{DeviceFilter, OrderFilter, RecordFilter, Store};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub running: u32,
    pub success: u32,
    pub failed: u32,
}

impl Counts {
    pub fn status(&self) -> StepStatus {
        if self.running > 0 {
            StepStatus::Handling
        } else if self.success > 0 {
            StepStatus::Success
        } else if self.failed > 0 {
            StepStatus::Failed
        } else {
            StepStatus::Init
        }
    }
}

async fn load_order(store: &dyn Store, suborder_id: &str) -> Result<ApplyOrder> {
    store
        .get_order(suborder_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("order {}", suborder_id)))
}

async fn load_step(store: &dyn Store, order: &ApplyOrder, name: StepName) -> Result<ApplyStep> {
    Ok(store
        .find_steps(&order.suborder_id)
        .await?
        .into_iter()
        .find(|s| s.step == name)
        .unwrap_or_else(|| ApplyStep::new(&order.suborder_id, name, order.total)))
}

/// Refuse to move `name` past Init while its predecessor has not succeeded.
async fn check_order(
    store: &dyn Store,
    order: &ApplyOrder,
    name: StepName,
    next: StepStatus,
) -> Result<()> {
    if next == StepStatus::Init || next == StepStatus::Failed {
        return Ok(());
    }
    let Some(before) = name.predecessor(order.enable_disk_check) else {
        return Ok(());
    };
    let prev = load_step(store, order, before).await?;
    if prev.status != StepStatus::Success {
        return Err(OrchestratorError::StepOrder {
            suborder_id: order.suborder_id.clone(),
            step: name,
            blocked_by: before,
        });
    }
    Ok(())
}

async fn save(
    store: &dyn Store,
    order: &ApplyOrder,
    name: StepName,
    counts: Counts,
) -> Result<ApplyStep> {
    let mut step = load_step(store, order, name).await?;
    let mut status = counts.status();
    // nothing to count yet: keep an explicit failure visible
    if status == StepStatus::Init && step.status == StepStatus::Failed {
        status = StepStatus::Failed;
    }
    check_order(store, order, name, status).await?;

    let now = Utc::now();
    step.total = order.total;
    step.running = counts.running;
    step.success = counts.success.min(order.total);
    step.failed = counts.failed;
    if status != StepStatus::Init {
        step.start_at.get_or_insert(now);
    }
    step.end_at = if status.is_terminal() { Some(now) } else { None };
    if status == StepStatus::Success && counts.failed == 0 {
        step.message.clear();
    }
    if step.status != status {
        tracing::debug!(
            suborder_id = %order.suborder_id,
            "[steps] {} {:?} -> {:?}",
            name.as_str(),
            step.status,
            status
        );
    }
    step.status = status;
    step.update_at = now;
    store.upsert_step(&step).await?;
    Ok(step)
}

pub async fn update_generate_step(store: &dyn Store, suborder_id: &str) -> Result<ApplyStep> {
    let order = load_order(store, suborder_id).await?;
    let records = store.find_records(&RecordFilter::suborder(suborder_id)).await?;
    let devices = store
        .count_devices(&DeviceFilter::suborder(suborder_id))
        .await? as u32;
    let mut counts = Counts {
        success: devices,
        ..Counts::default()
    };
    for r in &records {
        match r.status {
            GenerateStatus::Init | GenerateStatus::Handling => counts.running += r.total_num,
            GenerateStatus::Failed | GenerateStatus::Suspend => counts.failed += r.total_num,
            GenerateStatus::Success => {}
        }
    }
    save(store, &order, StepName::Generate, counts).await
}

fn stage_done(kind: StageKind, d: &DeviceInfo) -> bool {
    match kind {
        StageKind::Init => d.stage.is_inited(),
        StageKind::DiskCheck => d.stage.is_disk_checked(),
        StageKind::Deliver => d.stage.is_delivered(),
    }
}

async fn update_stage_step(store: &dyn Store, suborder_id: &str, kind: StageKind) -> Result<ApplyStep> {
    let order = load_order(store, suborder_id).await?;
    let devices = store.find_devices(&DeviceFilter::suborder(suborder_id)).await?;
    let records = store.find_stage_records(kind, suborder_id).await?;
    let mut counts = Counts::default();
    for d in &devices {
        if stage_done(kind, d) {
            counts.success += 1;
            continue;
        }
        match records.iter().find(|r| r.ip == d.ip).map(|r| r.status) {
            Some(RecordStatus::Failed) => counts.failed += 1,
            Some(RecordStatus::Init) | Some(RecordStatus::Handling) => counts.running += 1,
            Some(RecordStatus::Success) | None => {}
        }
    }
    save(store, &order, kind.step(), counts).await
}

pub async fn update_init_step(store: &dyn Store, suborder_id: &str) -> Result<ApplyStep> {
    update_stage_step(store, suborder_id, StageKind::Init).await
}

pub async fn update_disk_check_step(store: &dyn Store, suborder_id: &str) -> Result<ApplyStep> {
    update_stage_step(store, suborder_id, StageKind::DiskCheck).await
}

pub async fn update_deliver_step(store: &dyn Store, suborder_id: &str) -> Result<ApplyStep> {
    update_stage_step(store, suborder_id, StageKind::Deliver).await
}

pub async fn fail_step(
    store: &dyn Store,
    suborder_id: &str,
    name: StepName,
    err: &OrchestratorError,
) -> Result<()> {
    let order = load_order(store, suborder_id).await?;
    let mut step = load_step(store, &order, name).await?;
    let now = Utc::now();
    step.status = StepStatus::Failed;
    step.message = err.to_string();
    step.start_at.get_or_insert(now);
    step.end_at = Some(now);
    step.update_at = now;
    store.upsert_step(&step).await?;
    Ok(())
}

/// Status the counters call for, before operator decisions are taken into account.
pub fn derive_status(delivered: u32, total: u32, in_flight: bool) -> OrderStatus {
    if delivered >= total {
        OrderStatus::Done
    } else if in_flight {
        OrderStatus::Matching
    } else if delivered > 0 {
        OrderStatus::MatchedSome
    } else {
        OrderStatus::Terminate
    }
}

/// Recompute progress and settle the order status, then close the ticket once every
/// suborder is finished.
///
/// An operator's Terminate always stands. Paused and GracefulTerminate stand unless the
/// order turns out complete.
pub async fn final_apply_step(store: &dyn Store, suborder_id: &str) -> Result<OrderStatus> {
    let mut order = load_order(store, suborder_id).await?;
    let devices = store.find_devices(&DeviceFilter::suborder(suborder_id)).await?;
    let records = store.find_records(&RecordFilter::suborder(suborder_id)).await?;
    let delivered = devices.iter().filter(|d| d.stage.is_delivered()).count() as u32;
    let in_flight = records.iter().any(|r| r.status.is_in_flight());

    let computed = derive_status(delivered, order.total, in_flight);
    let current = order.status;
    let next = match current {
        OrderStatus::Terminate => OrderStatus::Terminate,
        OrderStatus::GracefulTerminate | OrderStatus::Paused if computed != OrderStatus::Done => {
            current
        }
        _ => computed,
    };

    let next = if next != current
        && !store.transition_order_status(suborder_id, &[current], next).await?
    {
        // someone moved the order meanwhile; their status wins
        let latest = load_order(store, suborder_id).await?;
        tracing::info!(
            suborder_id,
            "[steps] status changed to {} concurrently, keeping it",
            latest.status.as_str()
        );
        latest.status
    } else {
        next
    };

    // counters only, the status above is already settled
    order.status = next;
    order.success_num = delivered.min(order.total);
    order.pending_num = devices.len() as u32 - delivered;
    order.stage = match next {
        OrderStatus::Done => TicketStage::Done,
        OrderStatus::Terminate | OrderStatus::GracefulTerminate => TicketStage::Terminate,
        _ => TicketStage::Running,
    };
    order.update_at = Utc::now();
    store.update_order(&order).await?;

    tracing::info!(
        suborder_id,
        "[steps] {}/{} delivered, order {}",
        delivered,
        order.total,
        next.as_str()
    );
    close_ticket(store, order.order_id).await?;
    Ok(next)
}

/// Done when every suborder is Done, Terminate when all are finished otherwise.
pub async fn close_ticket(store: &dyn Store, order_id: u64) -> Result<()> {
    let Some(mut ticket) = store.get_ticket(order_id).await? else {
        return Ok(());
    };
    if ticket.stage.is_terminal() {
        return Ok(());
    }
    let orders = store
        .find_orders(&OrderFilter {
            order_id: Some(order_id),
            ..OrderFilter::default()
        })
        .await?;
    if orders.is_empty() || !orders.iter().all(|o| o.status.is_terminal()) {
        return Ok(());
    }
    ticket.stage = if orders.iter().all(|o| o.status == OrderStatus::Done) {
        TicketStage::Done
    } else {
        TicketStage::Terminate
    };
    store.update_ticket(&ticket).await?;
    tracing::info!("🏁 [steps] ticket {} closed as {}", order_id, ticket.stage.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use supply_common::*;

    async fn seeded(disk_check: bool) -> MemoryStore {
        let store = MemoryStore::new();
        let mut ticket = ApplyTicket::new(
            3,
            900,
            "erin",
            vec![SuborderRequest {
                resource_type: ResourceType::IdcPm,
                spec: ResourceSpec::default(),
                replicas: 2,
                remark: String::new(),
                enable_disk_check: disk_check,
            }],
        );
        ticket.stage = TicketStage::Running;
        store.insert_ticket(&ticket).await.unwrap();
        let mut order = ApplyOrder::from_request(&ticket, 0, &ticket.suborders[0]);
        order.status = OrderStatus::Matching;
        store.insert_order(&order).await.unwrap();
        for s in order.steps() {
            store
                .upsert_step(&ApplyStep::new(&order.suborder_id, s, 2))
                .await
                .unwrap();
        }
        store
    }

    async fn add_device(store: &MemoryStore, ip: &str, stage: DeviceStage) {
        let order = store.get_order("3-1").await.unwrap().unwrap();
        let mut rec = GenerateRecord::new(store.next_sequence("g").await.unwrap(), &order, 1);
        store.insert_record(&rec).await.unwrap();
        rec.status = GenerateStatus::Success;
        let mut d = DeviceInfo::new(&order, rec.generate_id, ip, &format!("A{}", ip));
        d.stage = stage;
        store.commit_generated(&rec, &[d]).await.unwrap();
    }

    #[test]
    fn status_from_counts() {
        assert_eq!(derive_status(2, 2, true), OrderStatus::Done);
        assert_eq!(derive_status(1, 2, true), OrderStatus::Matching);
        assert_eq!(derive_status(1, 2, false), OrderStatus::MatchedSome);
        assert_eq!(derive_status(0, 2, false), OrderStatus::Terminate);
    }

    #[tokio::test]
    async fn later_steps_wait_for_earlier_ones() {
        let store = seeded(false).await;
        add_device(&store, "10.0.0.1", DeviceStage::Inited).await;
        let err = update_init_step(&store, "3-1").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::StepOrder {
                step: StepName::Init,
                blocked_by: StepName::Generate,
                ..
            }
        ));

        update_generate_step(&store, "3-1").await.unwrap();
        let init = update_init_step(&store, "3-1").await.unwrap();
        assert_eq!(init.status, StepStatus::Success);
        assert_eq!(init.success, 1);
    }

    #[tokio::test]
    async fn deliver_skips_disabled_disk_check() {
        let store = seeded(false).await;
        add_device(&store, "10.0.0.1", DeviceStage::Delivered).await;
        update_generate_step(&store, "3-1").await.unwrap();
        update_init_step(&store, "3-1").await.unwrap();
        let deliver = update_deliver_step(&store, "3-1").await.unwrap();
        assert_eq!(deliver.status, StepStatus::Success);

        let store = seeded(true).await;
        add_device(&store, "10.0.0.1", DeviceStage::Delivered).await;
        update_generate_step(&store, "3-1").await.unwrap();
        update_init_step(&store, "3-1").await.unwrap();
        assert!(update_deliver_step(&store, "3-1").await.is_err());
    }

    #[tokio::test]
    async fn final_status_respects_operator_decisions() {
        let store = seeded(false).await;
        add_device(&store, "10.0.0.1", DeviceStage::Delivered).await;
        assert_eq!(
            final_apply_step(&store, "3-1").await.unwrap(),
            OrderStatus::MatchedSome
        );

        store
            .transition_order_status("3-1", &[OrderStatus::MatchedSome], OrderStatus::Paused)
            .await
            .unwrap();
        assert_eq!(final_apply_step(&store, "3-1").await.unwrap(), OrderStatus::Paused);

        add_device(&store, "10.0.0.2", DeviceStage::Delivered).await;
        assert_eq!(final_apply_step(&store, "3-1").await.unwrap(), OrderStatus::Done);
        let order = store.get_order("3-1").await.unwrap().unwrap();
        assert_eq!(order.success_num, 2);
        assert_eq!(order.stage, TicketStage::Done);
        let ticket = store.get_ticket(3).await.unwrap().unwrap();
        assert_eq!(ticket.stage, TicketStage::Done);
    }
}
