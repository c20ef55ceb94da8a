use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use supply_common::{ApplyOrder, GenerateRecord};

use super::pm::as_instance;
use super::Generator;
use crate::error::{OrchestratorError, Result};

/// Operator choice kept on the record for recovery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ManualRequest {
    pub asset_ids: Vec<String>,
    #[serde(default)]
    pub operator: String,
}

impl Generator {
    /// Bind operator-chosen hosts to the order, pulling them into the staging business
    /// from wherever they are.
    pub async fn manual_match(
        &self,
        order: &ApplyOrder,
        asset_ids: &[String],
        operator: &str,
    ) -> Result<u64> {
        let existing = self.existing_devices(&order.suborder_id).await?;
        let bound: HashSet<&str> = existing.iter().map(|d| d.asset_id.as_str()).collect();
        let mut wanted: Vec<String> = Vec::new();
        for a in asset_ids {
            if !bound.contains(a.as_str()) && !wanted.contains(a) {
                wanted.push(a.clone());
            }
        }
        if wanted.is_empty() {
            return Err(OrchestratorError::EmptyResult(format!(
                "manual match for {}",
                order.suborder_id
            )));
        }

        let biz = self.clients.cmdb.get_host_biz_ids(&wanted).await?;
        if let Some(missing) = wanted
            .iter()
            .find(|a| !biz.iter().any(|b| &b.asset_id == *a))
        {
            return Err(OrchestratorError::NotFound(format!("host {}", missing)));
        }

        let request = ManualRequest {
            asset_ids: wanted.clone(),
            operator: operator.to_string(),
        };
        let id = self.store.next_sequence("generate_id").await?;
        let mut rec = GenerateRecord::new(id, order, wanted.len() as u32);
        rec.is_manual_matched = true;
        rec.request = serde_json::to_value(&request).map_err(crate::store::StoreError::from)?;
        self.store.insert_record(&rec).await?;

        let res = self.run_manual(order, &mut rec, &wanted, &biz).await;
        self.settle(&mut rec, res).await
    }

    async fn run_manual(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
        wanted: &[String],
        biz: &[supply_providers::inventory::HostBiz],
    ) -> Result<usize> {
        let task_id = format!("manual-{}", rec.generate_id);
        self.mark_handling(rec, &task_id, "").await?;

        let staging = self.cfg.staging_biz_id;
        let mut by_biz: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for b in biz.iter().filter(|b| b.bk_biz_id != staging) {
            by_biz.entry(b.bk_biz_id).or_default().push(b.asset_id.clone());
        }
        for (from, assets) in &by_biz {
            self.clients
                .cmdb
                .transfer_host(assets, *from, staging)
                .await?;
        }

        let hosts = self.clients.cmdb.get_host_info_by_asset(wanted).await?;
        let instances = hosts.iter().map(as_instance).collect();
        self.add_devices(order, rec, instances, false).await
    }

    /// Finish a manual batch interrupted after it was marked Handling.
    ///
    /// Only the transfers may be missing. The batch completes when every chosen host already
    /// sits in the staging business; otherwise its outcome is unknown and the record fails.
    pub(crate) async fn resume_manual(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
    ) -> Result<u64> {
        let res = self.finish_manual(order, rec).await;
        self.settle(rec, res).await
    }

    async fn finish_manual(&self, order: &ApplyOrder, rec: &mut GenerateRecord) -> Result<usize> {
        let request: ManualRequest = serde_json::from_value(rec.request.clone())
            .map_err(crate::store::StoreError::from)?;
        if request.asset_ids.is_empty() {
            return Err(OrchestratorError::UnknownOutcome(format!(
                "manual record {}",
                rec.generate_id
            )));
        }
        let biz = self
            .clients
            .cmdb
            .get_host_biz_ids(&request.asset_ids)
            .await?;
        let staging = self.cfg.staging_biz_id;
        let staged = request
            .asset_ids
            .iter()
            .filter(|a| biz.iter().any(|b| &b.asset_id == *a && b.bk_biz_id == staging))
            .count();
        if staged != request.asset_ids.len() {
            return Err(OrchestratorError::UnknownOutcome(format!(
                "transfer of manual record {} ({} of {} hosts staged)",
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
