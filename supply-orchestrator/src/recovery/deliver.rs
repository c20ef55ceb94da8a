use supply_common::{ApplyOrder, DeviceStage, RecordStatus, StageKind, StageRecord};

use super::Recoverer;
use crate::error::{OrchestratorError, Result};
use crate::store::DeviceFilter;
use crate::workflow::deliver::settle_delivery;

impl Recoverer {
    /// Resolve devices caught mid-transfer, then deliver whatever is left.
    pub(super) async fn recover_deliver(&self, order: &ApplyOrder) -> Result<()> {
        let store = self.engine.store.as_ref();
        let filter = DeviceFilter {
            stages: vec![DeviceStage::Delivering],
            ..DeviceFilter::suborder(&order.suborder_id)
        };
        for device in store.find_devices(&filter).await? {
            let ip = device.ip.clone();
            let mut rec = store
                .get_stage_record(StageKind::Deliver, &order.suborder_id, &ip)
                .await?
                .unwrap_or_else(|| StageRecord::new(StageKind::Deliver, &device));
            if let Err(e) = settle_delivery(&self.engine, order, device, &mut rec).await {
                if matches!(e, OrchestratorError::DeviceDrifted { .. }) {
                    tracing::error!(
                        suborder_id = %order.suborder_id,
                        "❌ [recovery] {} left staging for an unexpected business: {}",
                        ip,
                        e
                    );
                } else {
                    tracing::warn!(suborder_id = %order.suborder_id, "⚠️ [recovery] {}: {}", ip, e);
                }
                rec.status = RecordStatus::Failed;
                rec.message = e.to_string();
                rec.update_at = chrono::Utc::now();
                store.upsert_stage_record(&rec).await?;
            }
        }
        self.sweep(order).await?;
        self.finish(order).await
    }
}

#[cfg(test)]
mod tests {
    use crate::recovery::tests::recoverer;
    use crate::state_machine;
    use crate::store::{DeviceFilter, Store};
    use crate::workflow::tests::{approved, cvm_request, STAGING};
    use std::sync::Arc;
    use supply_common::*;
    use supply_providers::inventory::HostInfo;
    use supply_providers::mock::MockCloud;

    /// Two devices caught mid-transfer: one still in staging, one moved to an unrelated
    /// business by hand.
    #[tokio::test]
    async fn drifted_hosts_are_reported_not_guessed() {
        let cloud = Arc::new(MockCloud::new());
        let (rec, engine, store) = recoverer(cloud.clone());
        approved(&engine, vec![cvm_request("gz-1", 2)]).await;
        state_machine::lock_for_matching(store.as_ref(), "1-1")
            .await
            .unwrap();
        let order = store.get_order("1-1").await.unwrap().unwrap();

        let mut batch = GenerateRecord::new(1, &order, 2);
        store.insert_record(&batch).await.unwrap();
        batch.status = GenerateStatus::Success;
        let mut devices = Vec::new();
        for (n, biz) in [(1, STAGING), (2, 4242)] {
            let ip = format!("10.8.0.{}", n);
            let asset = format!("D{}", n);
            cloud.add_cmdb_host(HostInfo {
                asset_id: asset.clone(),
                ip: ip.clone(),
                bk_biz_id: biz,
                ..Default::default()
            });
            let mut d = DeviceInfo::new(&order, 1, &ip, &asset);
            d.stage = DeviceStage::Delivering;
            devices.push(d);
        }
        store.commit_generated(&batch, &devices).await.unwrap();
        for (name, status) in [
            (StepName::Generate, StepStatus::Success),
            (StepName::Init, StepStatus::Success),
        ] {
            let mut step = ApplyStep::new("1-1", name, 2);
            step.status = status;
            store.upsert_step(&step).await.unwrap();
        }

        rec.run().await.unwrap();

        assert_eq!(cloud.host("D1").unwrap().bk_biz_id, 900);
        assert_eq!(cloud.host("D2").unwrap().bk_biz_id, 4242);
        let stored = store
            .find_devices(&DeviceFilter::suborder("1-1"))
            .await
            .unwrap();
        assert_eq!(stored[0].stage, DeviceStage::Delivered);
        assert_eq!(stored[1].stage, DeviceStage::Delivering);
        let failed = store
            .get_stage_record(StageKind::Deliver, "1-1", "10.8.0.2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, RecordStatus::Failed);
        let order = store.get_order("1-1").await.unwrap().unwrap();
        assert_eq!(order.success_num, 1);
        assert_eq!(order.status, OrderStatus::MatchedSome);
    }
}
