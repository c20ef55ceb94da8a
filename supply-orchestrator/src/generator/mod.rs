//! Turns an order's missing replicas into persisted devices.
//!
//! Every batch follows the same protocol: a [`GenerateRecord`] in `Init` is written before
//! any remote call, flipped to `Handling` once the remote side accepted the request (with its
//! order id), and moved to `Success` in the same transaction that inserts the devices. A
//! record that is still `Init` after a crash therefore means "outcome unknown", which the
//! recoverer never replays.

use std::collections::HashMap;
use std::sync::Arc;

use supply_common::{
    ApplyOrder, DeviceInfo, GenerateRecord, GenerateStatus, OrderStatus, ResourceType,
};
use supply_providers::inventory::{OrderState, ProvisionedInstance, RemoteOrder};

use crate::algorithm::Registry;
use crate::clients::Clients;
use crate::config::{DvmSpecTable, Settings};
use crate::error::{OrchestratorError, Result};
use crate::fanout::Collector;
use crate::retry::{poll_until, PollBudgets};
use crate::store::{DeviceFilter, RecordFilter, Store, StoreError};

mod cvm;
mod dvm;
mod manual;
mod pm;
mod pool;

pub use cvm::{plan_batches, plan_campuses, CvmBatch, ZoneQuota};

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub staging_biz_id: i64,
    pub pool_biz_id: i64,
    pub budgets: PollBudgets,
    pub dvm_specs: DvmSpecTable,
    pub concurrency: usize,
}

impl From<&Settings> for GeneratorConfig {
    fn from(s: &Settings) -> Self {
        Self {
            staging_biz_id: s.staging_biz_id,
            pool_biz_id: s.pool_biz_id,
            budgets: s.budgets,
            dvm_specs: s.dvm_specs.clone(),
            concurrency: s.concurrency,
        }
    }
}

/// Result of one generate pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GenerateOutcome {
    /// Records that reached `Success` during this pass.
    pub new_ids: Vec<u64>,
    /// Every successful record of the suborder not yet folded into order progress.
    pub unmatched_ids: Vec<u64>,
}

/// Which remote service a batch was sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteKind {
    Cvm,
    Dvm,
    Pool,
}

impl RemoteKind {
    pub fn of(resource_type: ResourceType) -> Option<Self> {
        match resource_type {
            ResourceType::QcloudCvm | ResourceType::UpgradeCvm => Some(RemoteKind::Cvm),
            ResourceType::IdcDvm | ResourceType::QcloudDvm => Some(RemoteKind::Dvm),
            ResourceType::Pool => Some(RemoteKind::Pool),
            ResourceType::IdcPm => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RemoteKind::Cvm => "cvm",
            RemoteKind::Dvm => "dvm",
            RemoteKind::Pool => "recall",
        }
    }
}

pub struct Generator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clients: Clients,
    pub(crate) registry: Arc<Registry>,
    pub(crate) cfg: GeneratorConfig,
}

impl Generator {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Clients,
        registry: Arc<Registry>,
        cfg: GeneratorConfig,
    ) -> Self {
        Self {
            store,
            clients,
            registry,
            cfg,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.cfg
    }

    /// Provision whatever the order still lacks.
    ///
    /// Fails only when batches were launched and none of them succeeded. Batches cut short
    /// because the order was terminated do not count as failures.
    pub async fn generate(&self, order: &ApplyOrder) -> Result<GenerateOutcome> {
        let batches = match order.resource_type {
            ResourceType::QcloudCvm | ResourceType::UpgradeCvm => self.generate_cvm(order).await?,
            ResourceType::IdcDvm | ResourceType::QcloudDvm => self.generate_dvm(order).await?,
            ResourceType::IdcPm => self.generate_pm(order).await?,
            ResourceType::Pool => self.generate_pool(order).await?,
        };
        batches.log_failures("generator");

        let cancelled = batches
            .failed
            .iter()
            .all(|(_, e)| matches!(e, OrchestratorError::OrderInactive(_)));
        if batches.total() > 0 && batches.is_empty_success() && !cancelled {
            return Err(OrchestratorError::NoRecordSucceeded(format!(
                "{} ({})",
                order.suborder_id,
                batches.last_error().unwrap_or_default()
            )));
        }

        Ok(GenerateOutcome {
            new_ids: batches.succeeded,
            unmatched_ids: self.unmatched_ids(&order.suborder_id).await?,
        })
    }

    pub async fn unmatched_ids(&self, suborder_id: &str) -> Result<Vec<u64>> {
        let filter = RecordFilter {
            statuses: vec![GenerateStatus::Success],
            is_matched: Some(false),
            ..RecordFilter::suborder(suborder_id)
        };
        Ok(self
            .store
            .find_records(&filter)
            .await?
            .into_iter()
            .map(|r| r.generate_id)
            .collect())
    }

    pub(crate) async fn existing_devices(&self, suborder_id: &str) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .store
            .find_devices(&DeviceFilter::suborder(suborder_id))
            .await?)
    }

    /// False once the order was asked to stop; no new batch may start after that.
    pub(crate) async fn accepts_new_batches(&self, suborder_id: &str) -> Result<bool> {
        let order = self
            .store
            .get_order(suborder_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {}", suborder_id)))?;
        Ok(!matches!(
            order.status,
            OrderStatus::Terminate | OrderStatus::GracefulTerminate
        ))
    }

    pub(crate) async fn create_record<R: serde::Serialize>(
        &self,
        order: &ApplyOrder,
        total: u32,
        zone: &str,
        subnet_id: &str,
        request: &R,
    ) -> Result<GenerateRecord> {
        let id = self.store.next_sequence("generate_id").await?;
        let mut rec = GenerateRecord::new(id, order, total);
        rec.zone = zone.to_string();
        rec.subnet_id = subnet_id.to_string();
        rec.request = serde_json::to_value(request).map_err(StoreError::from)?;
        self.store.insert_record(&rec).await?;
        tracing::info!(
            suborder_id = %order.suborder_id,
            generate_id = id,
            "[generator] record created for {} device(s)",
            total
        );
        Ok(rec)
    }

    pub(crate) async fn mark_handling(
        &self,
        rec: &mut GenerateRecord,
        task_id: &str,
        link: &str,
    ) -> Result<()> {
        rec.status = GenerateStatus::Handling;
        rec.task_id = task_id.to_string();
        rec.task_link = link.to_string();
        rec.update_at = chrono::Utc::now();
        self.store.update_record(rec).await?;
        Ok(())
    }

    pub(crate) async fn mark_failed(&self, rec: &mut GenerateRecord, err: &OrchestratorError) {
        rec.status = GenerateStatus::Failed;
        rec.message = err.to_string();
        rec.update_at = chrono::Utc::now();
        if let Err(e) = self.store.update_record(rec).await {
            tracing::error!(
                generate_id = rec.generate_id,
                "❌ [generator] cannot mark record failed: {}",
                e
            );
        }
    }

    pub(crate) async fn mark_suspend(&self, rec: &mut GenerateRecord, reason: &str) -> Result<()> {
        rec.status = GenerateStatus::Suspend;
        rec.message = reason.to_string();
        rec.update_at = chrono::Utc::now();
        self.store.update_record(rec).await?;
        Ok(())
    }

    /// Map a batch outcome to the record: failures are written back, a terminated order
    /// leaves the record untouched.
    pub(crate) async fn settle(
        &self,
        rec: &mut GenerateRecord,
        res: Result<usize>,
    ) -> Result<u64> {
        match res {
            Ok(n) => {
                tracing::info!(
                    suborder_id = %rec.suborder_id,
                    generate_id = rec.generate_id,
                    "✅ [generator] {} device(s) persisted",
                    n
                );
                Ok(rec.generate_id)
            }
            Err(OrchestratorError::OrderInactive(id)) => {
                tracing::info!(
                    suborder_id = %id,
                    generate_id = rec.generate_id,
                    "[generator] order stopped, batch result dropped"
                );
                Err(OrchestratorError::OrderInactive(id))
            }
            Err(e) => {
                self.mark_failed(rec, &e).await;
                Err(e)
            }
        }
    }

    async fn query(&self, kind: RemoteKind, task_id: &str) -> Result<RemoteOrder> {
        Ok(match kind {
            RemoteKind::Cvm => self.clients.cvm.query_order(task_id).await?,
            RemoteKind::Dvm => self.clients.dvm.query_order(task_id).await?,
            RemoteKind::Pool => self.clients.pool.query_recall_order(task_id).await?,
        })
    }

    async fn instances(&self, kind: RemoteKind, task_id: &str) -> Result<Vec<ProvisionedInstance>> {
        Ok(match kind {
            RemoteKind::Cvm => self.clients.cvm.list_instances(task_id).await?,
            RemoteKind::Dvm => self.clients.dvm.list_instances(task_id).await?,
            RemoteKind::Pool => self.clients.pool.list_recalled_instances(task_id).await?,
        })
    }

    /// Wait for a remote order to finish, then list what it produced.
    pub(crate) async fn wait_remote(
        &self,
        kind: RemoteKind,
        task_id: &str,
    ) -> Result<Vec<ProvisionedInstance>> {
        let budgets = &self.cfg.budgets;
        let order_budget = match kind {
            RemoteKind::Cvm => budgets.cvm_order,
            RemoteKind::Dvm => budgets.dvm_order,
            RemoteKind::Pool => budgets.pool_recall,
        };
        let this = self;
        let what = format!("{} order {}", kind.as_str(), task_id);
        poll_until(&what, order_budget, move || async move {
            let order = this.query(kind, task_id).await?;
            match order.state {
                OrderState::Running => Ok(None),
                OrderState::Success => Ok(Some(())),
                OrderState::Failed => Err(OrchestratorError::TaskFailed {
                    task_id: task_id.to_string(),
                    message: order.message,
                }),
            }
        })
        .await?;

        let listing = format!("instances of {}", what);
        let listed = poll_until(&listing, budgets.instance_list, move || async move {
            let found = this.instances(kind, task_id).await?;
            let ready = if found.is_empty() { None } else { Some(found) };
            Ok::<_, OrchestratorError>(ready)
        })
        .await;
        match listed {
            Err(OrchestratorError::Timeout { .. }) => Err(OrchestratorError::EmptyResult(what)),
            other => other,
        }
    }

    /// Finish a batch whose remote order was accepted before a restart.
    pub(crate) async fn resume_remote(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
    ) -> Result<u64> {
        let kind = RemoteKind::of(rec.resource_type).ok_or_else(|| {
            OrchestratorError::UnknownOutcome(format!("generate record {}", rec.generate_id))
        })?;
        if rec.task_id.is_empty() {
            return Err(OrchestratorError::UnknownOutcome(format!(
                "generate record {}",
                rec.generate_id
            )));
        }
        let task_id = rec.task_id.clone();
        let res = async {
            let instances = self.wait_remote(kind, &task_id).await?;
            self.add_devices(order, rec, instances, true).await
        }
        .await;
        self.settle(rec, res).await
    }

    /// Register the instances, read their topology and persist them with the record.
    ///
    /// Returns the number of devices written. The order is re-read first: a terminated order
    /// gets nothing committed.
    pub(crate) async fn add_devices(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
        instances: Vec<ProvisionedInstance>,
        register_in_cmdb: bool,
    ) -> Result<usize> {
        if instances.is_empty() {
            return Err(OrchestratorError::EmptyResult(format!(
                "generate record {}",
                rec.generate_id
            )));
        }
        let current = self
            .store
            .get_order(&order.suborder_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {}", order.suborder_id)))?;
        if current.status == OrderStatus::Terminate {
            return Err(OrchestratorError::OrderInactive(order.suborder_id.clone()));
        }

        if register_in_cmdb {
            self.clients
                .cmdb
                .add_host(&instances, self.cfg.staging_biz_id)
                .await?;
        }

        let assets: Vec<String> = instances.iter().map(|i| i.asset_id.clone()).collect();
        let topo: HashMap<String, _> = self
            .clients
            .cmdb
            .get_host_info_by_asset(&assets)
            .await?
            .into_iter()
            .map(|h| (h.asset_id.clone(), h))
            .collect();
        let parent_ips: Vec<String> = instances
            .iter()
            .filter(|i| !i.host_ip.is_empty())
            .map(|i| i.host_ip.clone())
            .collect();
        let parents: HashMap<String, _> = if parent_ips.is_empty() {
            HashMap::new()
        } else {
            self.clients
                .cmdb
                .get_host_info_by_ip(&parent_ips)
                .await?
                .into_iter()
                .map(|h| (h.ip.clone(), h))
                .collect()
        };

        let devices: Vec<DeviceInfo> = instances
            .iter()
            .map(|inst| {
                let mut d = DeviceInfo::new(order, rec.generate_id, &inst.ip, &inst.asset_id);
                d.instance_id = inst.instance_id.clone();
                d.host_ip = inst.host_ip.clone();
                d.zone = inst.zone.clone();
                d.is_manual_matched = rec.is_manual_matched;
                if let Some(t) = topo.get(&inst.asset_id) {
                    if !t.zone.is_empty() {
                        d.zone = t.zone.clone();
                    }
                    d.sub_zone = t.sub_zone.clone();
                    d.module = t.module.clone();
                    d.rack = t.rack.clone();
                }
                // docker VMs inherit placement from their physical host
                if let Some(p) = parents.get(&inst.host_ip) {
                    if d.module.is_empty() {
                        d.module = p.module.clone();
                    }
                    if d.rack.is_empty() {
                        d.rack = p.rack.clone();
                    }
                    if d.sub_zone.is_empty() {
                        d.sub_zone = p.sub_zone.clone();
                    }
                }
                d
            })
            .collect();

        let existing = self.existing_devices(&order.suborder_id).await?;
        if let Some(key) = first_clash(&existing, &devices) {
            return Err(OrchestratorError::DuplicateDevice {
                suborder_id: order.suborder_id.clone(),
                key,
            });
        }

        rec.status = GenerateStatus::Success;
        rec.success_num = devices.len() as u32;
        rec.success_list = devices.iter().map(|d| d.ip.clone()).collect();
        rec.message.clear();
        rec.update_at = chrono::Utc::now();
        match self.store.commit_generated(rec, &devices).await {
            Ok(()) => Ok(devices.len()),
            Err(StoreError::Duplicate { key, .. }) => Err(OrchestratorError::DuplicateDevice {
                suborder_id: order.suborder_id.clone(),
                key,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// First ip or asset of `incoming` already present in `existing` or repeated in `incoming`.
fn first_clash(existing: &[DeviceInfo], incoming: &[DeviceInfo]) -> Option<String> {
    let mut ips: std::collections::HashSet<&str> = existing.iter().map(|d| d.ip.as_str()).collect();
    let mut assets: std::collections::HashSet<&str> = existing
        .iter()
        .filter(|d| !d.asset_id.is_empty())
        .map(|d| d.asset_id.as_str())
        .collect();
    for d in incoming {
        if !ips.insert(d.ip.as_str()) {
            return Some(d.ip.clone());
        }
        if !d.asset_id.is_empty() && !assets.insert(d.asset_id.as_str()) {
            return Some(d.asset_id.clone());
        }
    }
    None
}

/// Merge per-batch outcomes into one collector.
pub(crate) fn merge(into: &mut Collector<u64>, other: Collector<u64>) {
    into.succeeded.extend(other.succeeded);
    into.failed.extend(other.failed);
}

/// `ceil(total / 2)`, the share of an order one campus or anti-affinity value may hold.
pub fn half_of(total: u32) -> u32 {
    (total + 1) / 2
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use supply_common::*;
    use supply_providers::mock::MockCloud;

    pub const STAGING: i64 = 5_000_001;

    pub fn order(resource_type: ResourceType, spec: ResourceSpec, replicas: u32) -> ApplyOrder {
        let ticket = ApplyTicket::new(
            42,
            777,
            "carol",
            vec![SuborderRequest {
                resource_type,
                spec,
                replicas,
                remark: String::new(),
                enable_disk_check: false,
            }],
        );
        let mut o = ApplyOrder::from_request(&ticket, 0, &ticket.suborders[0]);
        o.status = OrderStatus::Matching;
        o
    }

    pub async fn generator(cloud: Arc<MockCloud>) -> (Generator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings {
            staging_biz_id: STAGING,
            ..Settings::default()
        };
        let gen = Generator::new(
            store.clone(),
            Clients::from_backend(cloud),
            Arc::new(Registry::default_dvm().unwrap()),
            GeneratorConfig::from(&settings),
        );
        (gen, store)
    }

    fn instance(n: u32) -> ProvisionedInstance {
        ProvisionedInstance {
            instance_id: format!("ins-{}", n),
            asset_id: format!("TC{}", n),
            ip: format!("10.0.0.{}", n),
            zone: "gz-1".into(),
            host_ip: String::new(),
        }
    }

    #[tokio::test]
    async fn add_devices_commits_record_and_devices() {
        let cloud = Arc::new(MockCloud::new());
        let (gen, store) = generator(cloud.clone()).await;
        let o = order(ResourceType::QcloudCvm, ResourceSpec::default(), 2);
        store.insert_order(&o).await.unwrap();
        let mut rec = gen.create_record(&o, 2, "gz-1", "", &()).await.unwrap();

        let n = gen
            .add_devices(&o, &mut rec, vec![instance(1), instance(2)], true)
            .await
            .unwrap();
        assert_eq!(n, 2);
        let stored = store.get_record(rec.generate_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GenerateStatus::Success);
        assert_eq!(stored.success_list, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(cloud.host("TC1").unwrap().bk_biz_id, STAGING);
    }

    #[tokio::test]
    async fn add_devices_rejects_rebinding_an_ip() {
        let cloud = Arc::new(MockCloud::new());
        let (gen, store) = generator(cloud).await;
        let o = order(ResourceType::QcloudCvm, ResourceSpec::default(), 3);
        store.insert_order(&o).await.unwrap();
        let mut first = gen.create_record(&o, 1, "", "", &()).await.unwrap();
        gen.add_devices(&o, &mut first, vec![instance(1)], false)
            .await
            .unwrap();

        let mut second = gen.create_record(&o, 1, "", "", &()).await.unwrap();
        let err = gen
            .add_devices(&o, &mut second, vec![instance(1)], false)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateDevice { .. }));
        let devices = gen.existing_devices(&o.suborder_id).await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn terminated_order_commits_nothing() {
        let cloud = Arc::new(MockCloud::new());
        let (gen, store) = generator(cloud).await;
        let mut o = order(ResourceType::QcloudCvm, ResourceSpec::default(), 1);
        o.status = OrderStatus::Terminate;
        store.insert_order(&o).await.unwrap();
        let mut rec = gen.create_record(&o, 1, "", "", &()).await.unwrap();

        let res = gen.add_devices(&o, &mut rec, vec![instance(1)], false).await;
        let err = gen.settle(&mut rec, res).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::OrderInactive(_)));
        let stored = store.get_record(rec.generate_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GenerateStatus::Init);
        assert!(gen.existing_devices(&o.suborder_id).await.unwrap().is_empty());
    }

    #[test]
    fn half_rounds_up() {
        assert_eq!(half_of(10), 5);
        assert_eq!(half_of(5), 3);
        assert_eq!(half_of(1), 1);
    }
}
