use std::collections::HashMap;

use serde::Serialize;
use supply_common::ApplyOrder;
use supply_providers::inventory::{CvmCreateRequest, Subnet, ZoneCapacity};

use super::{half_of, Generator, RemoteKind};
use crate::error::{OrchestratorError, Result};
use crate::fanout::{fan_out, Collector};
use crate::retry::retry_transient;

/// Upper bound of instances in one create call.
pub const MAX_CVM_BATCH: u32 = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneQuota {
    pub zone: String,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CvmBatch {
    pub zone: String,
    /// Empty lets the cloud pick.
    pub subnet_id: String,
    pub count: u32,
}

/// Split `remaining` across campuses so that no campus ends up with more than half of
/// `total`. `placed` holds devices already provisioned per campus.
pub fn plan_campuses(
    total: u32,
    remaining: u32,
    capacities: &[ZoneCapacity],
    placed: &HashMap<String, u32>,
) -> Vec<ZoneQuota> {
    let half = half_of(total);
    let mut zones: Vec<&ZoneCapacity> = capacities.iter().filter(|c| c.max_count > 0).collect();
    zones.sort_by(|a, b| b.max_count.cmp(&a.max_count).then_with(|| a.zone.cmp(&b.zone)));

    if zones.len() == 1 {
        let count = remaining.min(zones[0].max_count).min(half);
        return if count > 0 {
            vec![ZoneQuota {
                zone: zones[0].zone.clone(),
                count,
            }]
        } else {
            vec![]
        };
    }

    let mut left = remaining;
    let mut out = Vec::new();
    for z in zones {
        if left == 0 {
            break;
        }
        let already = placed.get(&z.zone).copied().unwrap_or(0);
        let count = z.max_count.min(half.saturating_sub(already)).min(left);
        if count > 0 {
            out.push(ZoneQuota {
                zone: z.zone.clone(),
                count,
            });
            left -= count;
        }
    }
    out
}

/// Cut one campus quota into create calls, biggest subnets first. Without subnets the
/// quota is cut into plain chunks.
pub fn plan_batches(zone: &str, count: u32, subnets: &[Subnet]) -> Vec<CvmBatch> {
    let mut out = Vec::new();
    let mut left = count;
    if subnets.is_empty() {
        while left > 0 {
            let n = left.min(MAX_CVM_BATCH);
            out.push(CvmBatch {
                zone: zone.to_string(),
                subnet_id: String::new(),
                count: n,
            });
            left -= n;
        }
        return out;
    }

    let mut sorted: Vec<&Subnet> = subnets.iter().filter(|s| s.available_ips > 0).collect();
    sorted.sort_by(|a, b| {
        b.available_ips
            .cmp(&a.available_ips)
            .then_with(|| a.subnet_id.cmp(&b.subnet_id))
    });
    for s in sorted {
        let mut free = s.available_ips;
        while left > 0 && free > 0 {
            let n = left.min(free).min(MAX_CVM_BATCH);
            out.push(CvmBatch {
                zone: zone.to_string(),
                subnet_id: s.subnet_id.clone(),
                count: n,
            });
            left -= n;
            free -= n;
        }
    }
    out
}

impl Generator {
    pub(super) async fn generate_cvm(&self, order: &ApplyOrder) -> Result<Collector<u64>> {
        let existing = self.existing_devices(&order.suborder_id).await?;
        let remaining = order.total.saturating_sub(existing.len() as u32);
        if remaining == 0 {
            tracing::info!(
                suborder_id = %order.suborder_id,
                "[generator] cvm already complete ({} devices)",
                existing.len()
            );
            return Ok(Collector::default());
        }

        let spec = &order.spec;
        let quotas = if spec.is_separate_campus() {
            let cvm = &self.clients.cvm;
            let zones = cvm.list_zones(&spec.region, &spec.device_type).await?;
            let caps = cvm
                .zone_capacity(&spec.region, &spec.device_type, &zones)
                .await?;
            let mut placed: HashMap<String, u32> = HashMap::new();
            for d in &existing {
                *placed.entry(d.zone.clone()).or_insert(0) += 1;
            }
            plan_campuses(order.total, remaining, &caps, &placed)
        } else {
            vec![ZoneQuota {
                zone: spec.zone.clone(),
                count: remaining,
            }]
        };
        if quotas.is_empty() {
            return Err(OrchestratorError::Unschedulable {
                suborder_id: order.suborder_id.clone(),
                reason: format!("no campus in {} has capacity for {}", spec.region, spec.device_type),
            });
        }

        let mut batches = Vec::new();
        for q in &quotas {
            let mut subnets = self
                .clients
                .cvm
                .list_subnets(&spec.region, &q.zone, &spec.vpc)
                .await?;
            if !spec.subnet.is_empty() {
                subnets.retain(|s| s.subnet_id == spec.subnet);
            }
            let planned = plan_batches(&q.zone, q.count, &subnets);
            let covered: u32 = planned.iter().map(|b| b.count).sum();
            if covered < q.count {
                tracing::warn!(
                    suborder_id = %order.suborder_id,
                    "⚠️ [generator] zone {} subnets only fit {} of {}",
                    q.zone,
                    covered,
                    q.count
                );
            }
            batches.extend(planned);
        }

        let items = batches
            .into_iter()
            .map(|b| (format!("cvm {}/{}", b.zone, b.subnet_id), b));
        Ok(fan_out(self.cfg.concurrency, items, |b| self.launch_cvm_batch(order, b)).await)
    }

    async fn launch_cvm_batch(&self, order: &ApplyOrder, batch: CvmBatch) -> Result<u64> {
        if !self.accepts_new_batches(&order.suborder_id).await? {
            return Err(OrchestratorError::OrderInactive(order.suborder_id.clone()));
        }
        let spec = &order.spec;
        let req = CvmCreateRequest {
            region: spec.region.clone(),
            zone: batch.zone.clone(),
            device_type: spec.device_type.clone(),
            image_id: spec.image_id.clone(),
            disk_type: spec.disk_type.clone(),
            disk_size_gb: spec.disk_size_gb,
            charge_type: spec.charge_type.clone(),
            charge_months: spec.charge_months,
            vpc_id: spec.vpc.clone(),
            subnet_id: batch.subnet_id.clone(),
            count: batch.count,
            remark: format!("supply {}", order.suborder_id),
        };
        let mut rec = self
            .create_record(order, batch.count, &batch.zone, &batch.subnet_id, &req)
            .await?;
        let res = self.run_cvm_batch(order, &mut rec, &req).await;
        self.settle(&mut rec, res).await
    }

    async fn run_cvm_batch(
        &self,
        order: &ApplyOrder,
        rec: &mut supply_common::GenerateRecord,
        req: &CvmCreateRequest,
    ) -> Result<usize> {
        let budgets = self.cfg.budgets;
        let cvm = &self.clients.cvm;
        let remote_id = retry_transient(
            "cvm create",
            budgets.create_attempts,
            budgets.create_backoff,
            move || async move {
                cvm.create_order(req)
                    .await
                    .map_err(OrchestratorError::from)
            },
        )
        .await?;
        self.mark_handling(rec, &remote_id, "").await?;
        let instances = self.wait_remote(RemoteKind::Cvm, &remote_id).await?;
        self.add_devices(order, rec, instances, true).await
    }
}
