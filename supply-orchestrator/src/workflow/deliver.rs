//! Hand devices over to the requesting business.

use chrono::Utc;
use supply_common::{ApplyOrder, DeviceInfo, DeviceStage, RecordStatus, StageKind, StageRecord};

use super::init::current_biz;
use super::Engine;
use crate::error::{OrchestratorError, Result};

pub(crate) async fn run(engine: &Engine, order: &ApplyOrder, mut device: DeviceInfo) -> Result<DeviceInfo> {
    if device.stage.is_delivered() {
        return Ok(device);
    }
    let store = engine.store.as_ref();
    device.stage = device.stage.advance(DeviceStage::Delivering)?;
    device.update_at = Utc::now();
    store.update_device(&device).await?;

    let mut rec = match store
        .get_stage_record(StageKind::Deliver, &device.suborder_id, &device.ip)
        .await?
    {
        Some(r) => r,
        None => StageRecord::new(StageKind::Deliver, &device),
    };
    rec.status = RecordStatus::Handling;
    rec.bk_biz_id = order.bk_biz_id;
    rec.update_at = Utc::now();
    store.upsert_stage_record(&rec).await?;

    match settle_delivery(engine, order, device, &mut rec).await {
        Ok(d) => Ok(d),
        Err(e) => {
            rec.status = RecordStatus::Failed;
            rec.message = e.to_string();
            rec.update_at = Utc::now();
            store.upsert_stage_record(&rec).await?;
            Err(e)
        }
    }
}

/// Finish a delivery whose transfer may or may not have happened.
///
/// A host still in staging is transferred, one already in the target business is left
/// alone, anywhere else it has drifted and is reported.
pub(crate) async fn settle_delivery(
    engine: &Engine,
    order: &ApplyOrder,
    mut device: DeviceInfo,
    rec: &mut StageRecord,
) -> Result<DeviceInfo> {
    let cmdb = &engine.clients.cmdb;
    let assets = std::slice::from_ref(&device.asset_id);
    let biz = current_biz(engine, &device).await?;
    if biz == engine.cfg.staging_biz_id {
        cmdb.transfer_host(assets, biz, order.bk_biz_id).await?;
    } else if biz != order.bk_biz_id {
        return Err(OrchestratorError::DeviceDrifted {
            asset_id: device.asset_id.clone(),
            bk_biz_id: biz,
        });
    }

    let operator = if order.user.is_empty() {
        engine.cfg.operator.as_str()
    } else {
        order.user.as_str()
    };
    cmdb.update_host_operator(assets, operator).await?;

    let now = Utc::now();
    rec.status = RecordStatus::Success;
    rec.message.clear();
    rec.update_at = now;
    engine.store.upsert_stage_record(rec).await?;

    device.stage = device.stage.advance(DeviceStage::Delivered)?;
    device.operator = operator.to_string();
    device.bk_biz_id = order.bk_biz_id;
    device.update_at = now;
    engine.store.update_device(&device).await?;
    tracing::info!(
        suborder_id = %order.suborder_id,
        "✅ [deliver] {} handed to biz {}",
        device.ip,
        order.bk_biz_id
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::workflow::tests::{approved, cvm_request, engine, STAGING};
    use std::sync::Arc;
    use supply_common::{GenerateRecord, GenerateStatus};
    use supply_providers::inventory::HostInfo;
    use supply_providers::mock::MockCloud;

    async fn inited(engine: &Engine, cloud: &MockCloud, biz: i64) -> (ApplyOrder, DeviceInfo) {
        cloud.add_cmdb_host(HostInfo {
            asset_id: "A1".into(),
            ip: "10.6.0.1".into(),
            bk_biz_id: biz,
            ..Default::default()
        });
        approved(engine, vec![cvm_request("gz-1", 1)]).await;
        let store = engine.store.as_ref();
        let order = store.get_order("1-1").await.unwrap().unwrap();
        let mut rec = GenerateRecord::new(1, &order, 1);
        store.insert_record(&rec).await.unwrap();
        rec.status = GenerateStatus::Success;
        let mut device = DeviceInfo::new(&order, 1, "10.6.0.1", "A1");
        device.stage = DeviceStage::Inited;
        store.commit_generated(&rec, &[device.clone()]).await.unwrap();
        (order, device)
    }

    #[tokio::test]
    async fn staged_host_moves_to_the_target_business() {
        let cloud = Arc::new(MockCloud::new());
        let (engine, store) = engine(cloud.clone(), false);
        let (order, device) = inited(&engine, &cloud, STAGING).await;

        let d = run(&engine, &order, device).await.unwrap();
        assert_eq!(d.stage, DeviceStage::Delivered);
        let host = cloud.host("A1").unwrap();
        assert_eq!(host.bk_biz_id, 900);
        assert_eq!(host.operator, "erin");
        let rec = store
            .get_stage_record(StageKind::Deliver, "1-1", "10.6.0.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, RecordStatus::Success);
    }

    #[tokio::test]
    async fn host_already_in_target_is_not_transferred_again() {
        let cloud = Arc::new(MockCloud::new());
        let (engine, _store) = engine(cloud.clone(), false);
        let (order, device) = inited(&engine, &cloud, 900).await;

        run(&engine, &order, device).await.unwrap();
        assert_eq!(cloud.counters().cmdb_transfer, 0);
    }

    #[tokio::test]
    async fn drifted_host_fails_the_record() {
        let cloud = Arc::new(MockCloud::new());
        let (engine, store) = engine(cloud.clone(), false);
        let (order, device) = inited(&engine, &cloud, 31).await;

        let err = run(&engine, &order, device).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeviceDrifted { bk_biz_id: 31, .. }));
        let rec = store
            .get_stage_record(StageKind::Deliver, "1-1", "10.6.0.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, RecordStatus::Failed);
        let stored = store
            .find_devices(&crate::store::DeviceFilter::suborder("1-1"))
            .await
            .unwrap();
        assert_eq!(stored[0].stage, DeviceStage::Delivering);
    }
}
