use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use supply_common::{ApplyOrder, GenerateRecord};
use supply_providers::inventory::{HostInfo, PoolHostFilter, ProvisionedInstance};

use super::Generator;
use crate::error::{OrchestratorError, Result};
use crate::fanout::Collector;

/// What a physical machine batch planned to take, kept on the record for recovery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PmRequest {
    pub asset_ids: Vec<String>,
}

pub(crate) fn as_instance(h: &HostInfo) -> ProvisionedInstance {
    ProvisionedInstance {
        instance_id: String::new(),
        asset_id: h.asset_id.clone(),
        ip: h.ip.clone(),
        zone: h.zone.clone(),
        host_ip: String::new(),
    }
}

impl Generator {
    pub(super) async fn generate_pm(&self, order: &ApplyOrder) -> Result<Collector<u64>> {
        let existing = self.existing_devices(&order.suborder_id).await?;
        let remaining = order.total.saturating_sub(existing.len() as u32);
        if remaining == 0 {
            return Ok(Collector::default());
        }
        let spec = &order.spec;
        let filter = PoolHostFilter {
            bk_biz_id: self.cfg.pool_biz_id,
            region: spec.region.clone(),
            zone: if spec.is_separate_campus() {
                String::new()
            } else {
                spec.zone.clone()
            },
            device_type: spec.device_type.clone(),
            os_type: spec.os_type.clone(),
            raid_type: spec.raid_type.clone(),
            isp: spec.isp.clone(),
        };
        let bound: HashSet<&str> = existing.iter().map(|d| d.asset_id.as_str()).collect();
        let mut candidates: Vec<HostInfo> = self
            .clients
            .cmdb
            .list_pool_hosts(&filter)
            .await?
            .into_iter()
            .filter(|h| !bound.contains(h.asset_id.as_str()))
            .collect();
        // every candidate scores the same, asset id keeps the pick stable
        candidates.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        candidates.truncate(remaining as usize);
        if candidates.is_empty() {
            return Err(OrchestratorError::Unschedulable {
                suborder_id: order.suborder_id.clone(),
                reason: format!("no idle {} in the pool", spec.device_type),
            });
        }

        if !self.accepts_new_batches(&order.suborder_id).await? {
            return Ok(Collector::default());
        }
        let request = PmRequest {
            asset_ids: candidates.iter().map(|h| h.asset_id.clone()).collect(),
        };
        let mut rec = self
            .create_record(order, candidates.len() as u32, &filter.zone, "", &request)
            .await?;
        let res = self.run_pm_batch(order, &mut rec, &request, &candidates).await;
        let mut out = Collector::default();
        let label = format!("pm {}", rec.generate_id);
        out.push(label, self.settle(&mut rec, res).await);
        Ok(out)
    }

    async fn run_pm_batch(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
        request: &PmRequest,
        hosts: &[HostInfo],
    ) -> Result<usize> {
        let task_id = format!("pm-{}", rec.generate_id);
        self.mark_handling(rec, &task_id, "").await?;
        self.clients
            .cmdb
            .transfer_host(
                &request.asset_ids,
                self.cfg.pool_biz_id,
                self.cfg.staging_biz_id,
            )
            .await?;
        let instances = hosts.iter().map(as_instance).collect();
        self.add_devices(order, rec, instances, false).await
    }

    /// Finish a physical machine batch interrupted after it was marked Handling.
    ///
    /// The transfer either happened or it did not; only when every planned host already sits
    /// in the staging business is the batch completed.
    pub(crate) async fn resume_pm(&self, order: &ApplyOrder, rec: &mut GenerateRecord) -> Result<u64> {
        let res = self.finish_pm(order, rec).await;
        self.settle(rec, res).await
    }

    async fn finish_pm(&self, order: &ApplyOrder, rec: &mut GenerateRecord) -> Result<usize> {
        let request: PmRequest = serde_json::from_value(rec.request.clone())
            .map_err(crate::store::StoreError::from)?;
        if request.asset_ids.is_empty() {
            return Err(OrchestratorError::UnknownOutcome(format!(
                "generate record {}",
                rec.generate_id
            )));
        }
        let biz = self
            .clients
            .cmdb
            .get_host_biz_ids(&request.asset_ids)
            .await?;
        let staged = biz
            .iter()
            .filter(|b| b.bk_biz_id == self.cfg.staging_biz_id)
            .count();
        if staged != request.asset_ids.len() {
            return Err(OrchestratorError::UnknownOutcome(format!(
                "transfer of generate record {} ({} of {} hosts staged)",
                rec.generate_id,
                staged,
                request.asset_ids.len()
            )));
        }
        let hosts = self
            .clients
            .cmdb
            .get_host_info_by_asset(&request.asset_ids)
            .await?;
        let instances = hosts.iter().map(as_instance).collect();
        self.add_devices(order, rec, instances, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::{generator, order, STAGING};
    use crate::store::Store;
    use std::sync::Arc;
    use supply_common::{GenerateStatus, ResourceSpec, ResourceType};
    use supply_providers::mock::MockCloud;

    const POOL: i64 = 5_000_002;

    fn idle(asset: &str, ip: &str, device_type: &str) -> HostInfo {
        HostInfo {
            asset_id: asset.into(),
            ip: ip.into(),
            bk_biz_id: POOL,
            region: "gz".into(),
            zone: "gz-1".into(),
            device_type: device_type.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn takes_idle_hosts_matching_the_filter() {
        let cloud = Arc::new(MockCloud::new());
        cloud.add_cmdb_host(idle("PM3", "10.9.0.3", "M10"));
        cloud.add_cmdb_host(idle("PM1", "10.9.0.1", "M10"));
        cloud.add_cmdb_host(idle("PM2", "10.9.0.2", "M10"));
        cloud.add_cmdb_host(idle("PMX", "10.9.0.9", "Z30"));
        let (gen, store) = generator(cloud.clone()).await;
        let spec = ResourceSpec {
            region: "gz".into(),
            device_type: "M10".into(),
            ..Default::default()
        };
        let o = order(ResourceType::IdcPm, spec, 2);
        store.insert_order(&o).await.unwrap();

        let out = gen.generate(&o).await.unwrap();
        assert_eq!(out.new_ids.len(), 1);
        let devices = gen.existing_devices(&o.suborder_id).await.unwrap();
        let assets: Vec<&str> = devices.iter().map(|d| d.asset_id.as_str()).collect();
        assert_eq!(assets, vec!["PM1", "PM2"]);
        assert_eq!(cloud.host("PM1").unwrap().bk_biz_id, STAGING);
        assert_eq!(cloud.host("PM3").unwrap().bk_biz_id, POOL);
        let rec = store.get_record(out.new_ids[0]).await.unwrap().unwrap();
        assert_eq!(rec.task_id, format!("pm-{}", rec.generate_id));
    }

    #[tokio::test]
    async fn resume_fails_when_transfer_never_happened() {
        let cloud = Arc::new(MockCloud::new());
        cloud.add_cmdb_host(idle("PM1", "10.9.0.1", "M10"));
        let (gen, store) = generator(cloud.clone()).await;
        let o = order(ResourceType::IdcPm, ResourceSpec::default(), 1);
        store.insert_order(&o).await.unwrap();
        let request = PmRequest {
            asset_ids: vec!["PM1".into()],
        };
        let mut rec = gen.create_record(&o, 1, "", "", &request).await.unwrap();
        gen.mark_handling(&mut rec, "pm-x", "").await.unwrap();

        assert!(gen.resume_pm(&o, &mut rec).await.is_err());
        assert_eq!(rec.status, GenerateStatus::Failed);

        // once the hosts are staged the same record completes
        cloud.set_host_biz("PM1", STAGING);
        let mut rec = gen.create_record(&o, 1, "", "", &request).await.unwrap();
        gen.mark_handling(&mut rec, "pm-y", "").await.unwrap();
        gen.resume_pm(&o, &mut rec).await.unwrap();
        assert_eq!(rec.status, GenerateStatus::Success);
        assert_eq!(gen.existing_devices(&o.suborder_id).await.unwrap().len(), 1);
    }
}
