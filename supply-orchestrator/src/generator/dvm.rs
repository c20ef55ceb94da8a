use std::collections::HashMap;

use supply_common::{AntiAffinityLevel, ApplyOrder, DeviceInfo, GenerateRecord, ResourceType};
use supply_providers::inventory::{DvmCreateRequest, HostFilter};

use super::{half_of, Generator, RemoteKind};
use crate::algorithm::{Host, ScoredHost, Selector, MAX_VIRTUAL_RATIO};
use crate::config::DvmSpec;
use crate::error::{OrchestratorError, Result};
use crate::fanout::{fan_out, Collector};
use crate::retry::retry_transient;

#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub host: Host,
    pub count: u32,
}

/// Devices already bound, counted under the same key `Host::dimension` yields.
pub fn placed_per_dimension(
    existing: &[DeviceInfo],
    level: AntiAffinityLevel,
) -> HashMap<String, u32> {
    let mut placed = HashMap::new();
    if level == AntiAffinityLevel::None {
        return placed;
    }
    for d in existing {
        *placed.entry(d.dimension(level).to_string()).or_insert(0) += 1;
    }
    placed
}

/// Walk the ranked hosts and hand out replicas.
///
/// A host takes at most what fits by resources and by the virtual ratio. With anti-affinity,
/// one dimension value holds at most `ceil(total / 2)` devices including `placed`.
pub fn plan_placements(
    ranked: &[ScoredHost],
    total: u32,
    remaining: u32,
    spec: &DvmSpec,
    level: AntiAffinityLevel,
    placed: &HashMap<String, u32>,
) -> Vec<Placement> {
    let half = half_of(total);
    let mut per_dim = placed.clone();
    let mut left = remaining;
    let mut out = Vec::new();
    for sh in ranked {
        if left == 0 {
            break;
        }
        let h = &sh.host;
        let dim_budget = if level == AntiAffinityLevel::None {
            u32::MAX
        } else {
            let used = per_dim.get(h.dimension(level)).copied().unwrap_or(0);
            half.saturating_sub(used)
        };
        let count = left
            .min(h.allocatable(spec.cores, spec.mem_gb))
            .min(MAX_VIRTUAL_RATIO.saturating_sub(h.scheduled_vms))
            .min(dim_budget);
        if count == 0 {
            continue;
        }
        *per_dim.entry(h.dimension(level).to_string()).or_insert(0) += count;
        left -= count;
        out.push(Placement {
            host: h.clone(),
            count,
        });
    }
    out
}

impl Generator {
    pub(super) async fn generate_dvm(&self, order: &ApplyOrder) -> Result<Collector<u64>> {
        let existing = self.existing_devices(&order.suborder_id).await?;
        let remaining = order.total.saturating_sub(existing.len() as u32);
        if remaining == 0 {
            return Ok(Collector::default());
        }
        let spec = order.spec.clone();
        let dvm_spec = self.cfg.dvm_specs.get(&spec.device_type)?.clone();
        let wanted = if order.resource_type == ResourceType::IdcDvm {
            "IDC"
        } else {
            "QCLOUD"
        };

        let clusters: Vec<_> = self
            .clients
            .dvm
            .list_clusters()
            .await?
            .into_iter()
            .filter(|c| c.resource_type.eq_ignore_ascii_case(wanted) && c.region == spec.region)
            .collect();
        let mut inventory = Vec::new();
        for c in &clusters {
            let filter = HostFilter {
                cluster_id: c.cluster_id.clone(),
                region: spec.region.clone(),
                tlinux_version: c.tlinux_version.clone(),
            };
            inventory.extend(self.clients.dvm.list_hosts(&filter).await?);
        }
        let ips: Vec<String> = inventory.iter().map(|h| h.ip.clone()).collect();
        let topo: HashMap<String, _> = if ips.is_empty() {
            HashMap::new()
        } else {
            self.clients
                .cmdb
                .get_host_info_by_ip(&ips)
                .await?
                .into_iter()
                .map(|h| (h.ip.clone(), h))
                .collect()
        };
        let hosts: Vec<Host> = inventory
            .iter()
            .map(|h| Host::from_inventory(h, topo.get(&h.ip)))
            .collect();
        tracing::debug!(
            suborder_id = %order.suborder_id,
            "[generator] {} docker host(s) in {} cluster(s)",
            hosts.len(),
            clusters.len()
        );

        let selector = Selector {
            region: spec.region.clone(),
            zone: spec.zone.clone(),
            kernel_version: spec.kernel_version.clone(),
            cores: dvm_spec.cores,
            mem_gb: dvm_spec.mem_gb,
            cpu_provider: dvm_spec.cpu_provider.clone(),
            anti_affinity: spec.anti_affinity,
        };
        let ranked = self.registry.schedule(&selector, hosts).map_err(|e| {
            OrchestratorError::Unschedulable {
                suborder_id: order.suborder_id.clone(),
                reason: e.to_string(),
            }
        })?;

        let placed = placed_per_dimension(&existing, spec.anti_affinity);
        let plan = plan_placements(
            &ranked,
            order.total,
            remaining,
            &dvm_spec,
            spec.anti_affinity,
            &placed,
        );
        if plan.is_empty() {
            return Err(OrchestratorError::Unschedulable {
                suborder_id: order.suborder_id.clone(),
                reason: format!(
                    "{} eligible host(s), none with room for {}",
                    ranked.len(),
                    spec.device_type
                ),
            });
        }

        let items = plan
            .into_iter()
            .map(|p| (format!("dvm {}", p.host.ip), p));
        let dvm_spec = &dvm_spec;
        Ok(fan_out(self.cfg.concurrency, items, |p| {
            self.launch_dvm_batch(order, dvm_spec, p)
        })
        .await)
    }

    async fn launch_dvm_batch(
        &self,
        order: &ApplyOrder,
        dvm_spec: &DvmSpec,
        placement: Placement,
    ) -> Result<u64> {
        if !self.accepts_new_batches(&order.suborder_id).await? {
            return Err(OrchestratorError::OrderInactive(order.suborder_id.clone()));
        }
        let req = DvmCreateRequest {
            cluster_id: placement.host.cluster_id.clone(),
            host_ip: placement.host.ip.clone(),
            count: placement.count,
            cores: dvm_spec.cores,
            mem_gb: dvm_spec.mem_gb,
            disk_gb: dvm_spec.disk_gb,
            image_id: order.spec.image_id.clone(),
            network_type: dvm_spec.network_type.clone(),
        };
        let mut rec = self
            .create_record(order, placement.count, &placement.host.zone, "", &req)
            .await?;
        let res = self.run_dvm_batch(order, &mut rec, &req).await;
        self.settle(&mut rec, res).await
    }

    async fn run_dvm_batch(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
        req: &DvmCreateRequest,
    ) -> Result<usize> {
        let budgets = self.cfg.budgets;
        let dvm = &self.clients.dvm;
        let remote_id = retry_transient(
            "dvm create",
            budgets.create_attempts,
            budgets.create_backoff,
            move || async move {
                dvm.create_order(req)
                    .await
                    .map_err(OrchestratorError::from)
            },
        )
        .await?;
        self.mark_handling(rec, &remote_id, "").await?;
        let instances = self.wait_remote(RemoteKind::Dvm, &remote_id).await?;
        self.add_devices(order, rec, instances, true).await
    }
}
