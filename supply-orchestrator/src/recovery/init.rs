use supply_common::ApplyOrder;

use super::Recoverer;
use crate::error::Result;
use crate::store::DeviceFilter;

impl Recoverer {
    /// Resume an order that went down between generation and delivery.
    ///
    /// Devices re-enter the regular stage executors: the CMDB ownership check runs again for
    /// unchecked hosts, a task left Handling is polled again and one left Init adopts the
    /// task SOPS already knows about before a new one is launched.
    pub(super) async fn recover_init(&self, order: &ApplyOrder) -> Result<()> {
        let devices = self
            .engine
            .store
            .find_devices(&DeviceFilter::suborder(&order.suborder_id))
            .await?;
        let pending = devices.iter().filter(|d| !d.stage.is_inited()).count();
        tracing::info!(
            suborder_id = %order.suborder_id,
            "[recovery] {} of {} device(s) not inited yet",
            pending,
            devices.len()
        );
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
    use supply_providers::inventory::{HostInfo, SopsTask};
    use supply_providers::mock::MockCloud;

    /// Order crashed with its only batch generated and the device half way through init.
    #[tokio::test(start_paused = true)]
    async fn half_inited_devices_finish_without_new_batches() {
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
        for (n, stage) in [(1, DeviceStage::Checked), (2, DeviceStage::Generated)] {
            let ip = format!("10.4.0.{}", n);
            let asset = format!("A{}", n);
            cloud.add_cmdb_host(HostInfo {
                asset_id: asset.clone(),
                ip: ip.clone(),
                bk_biz_id: STAGING,
                ..Default::default()
            });
            let mut d = DeviceInfo::new(&order, 1, &ip, &asset);
            d.stage = stage;
            devices.push(d);
        }
        store.commit_generated(&batch, &devices).await.unwrap();
        let mut step = ApplyStep::new("1-1", StepName::Generate, 2);
        step.status = StepStatus::Success;
        store.upsert_step(&step).await.unwrap();

        // the first device's init task was launched, its record never got the task id
        let mut half = StageRecord::new(StageKind::Init, &devices[0]);
        half.status = RecordStatus::Init;
        store.upsert_stage_record(&half).await.unwrap();
        cloud.seed_task(SopsTask {
            task_id: "task-seeded".into(),
            name: "init-1-1-10.4.0.1".into(),
            bk_biz_id: STAGING,
            link: String::new(),
        });

        let report = rec.run().await.unwrap();
        assert_eq!(report.orders_recovered, 1);
        // only the second device needed a new task
        assert_eq!(cloud.counters().sops_create, 1);
        let stored = store
            .find_devices(&DeviceFilter::suborder("1-1"))
            .await
            .unwrap();
        assert!(stored.iter().all(|d| d.stage.is_delivered()));
        assert_eq!(stored[0].init_task, "task-seeded");
        let order = store.get_order("1-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Done);
    }
}
