//! In-process simulation of every downstream service.
//!
//! Orders complete on their first query unless `pending_polls` is set, hosts live in an
//! in-memory CMDB, and every mutating call is counted so callers can assert that a retry
//! path never re-issued a provisioning request.

use crate::inventory::*;
use crate::{
    CmdbClient, CvmClient, DvmClient, ItsmClient, PoolClient, RemoteError, Result, SopsClient,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct MockZone {
    capacity: u32,
    subnets: Vec<Subnet>,
}

struct MockOrder {
    remaining_polls: u32,
    state: OrderState,
    instances: Vec<ProvisionedInstance>,
}

#[derive(Default)]
struct MockState {
    seq: u32,
    zones: BTreeMap<(String, String), MockZone>,
    cvm_orders: HashMap<String, MockOrder>,
    dvm_orders: HashMap<String, MockOrder>,
    recall_orders: HashMap<String, MockOrder>,
    clusters: Vec<DvmCluster>,
    dvm_hosts: Vec<DvmHost>,
    cmdb: BTreeMap<String, HostInfo>,
    itsm: HashMap<String, TicketResult>,
    tasks: Vec<SopsTask>,
    failing_task_ips: HashSet<String>,
    /// Listed by name but no longer answering detail queries.
    stale_tasks: HashSet<String>,
    pending_polls: u32,
    cvm_create_failures: Vec<RemoteError>,
    counters: MockCounters,
}

/// Number of side-effecting calls received so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub cvm_create: u32,
    pub dvm_create: u32,
    pub recall_create: u32,
    pub sops_create: u32,
    pub cmdb_add: u32,
    pub cmdb_transfer: u32,
    pub itsm_queries: u32,
    pub itsm_max_batch: usize,
}

#[derive(Default)]
pub struct MockCloud {
    state: Mutex<MockState>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Register a CVM zone with its capacity and subnets `(subnet_id, available_ips)`.
    pub fn add_zone(&self, region: &str, zone: &str, capacity: u32, subnets: &[(&str, u32)]) {
        self.with_state(|s| {
            s.zones.insert(
                (region.to_string(), zone.to_string()),
                MockZone {
                    capacity,
                    subnets: subnets
                        .iter()
                        .map(|(id, ips)| Subnet {
                            subnet_id: id.to_string(),
                            zone: zone.to_string(),
                            vpc_id: "vpc-mock".to_string(),
                            available_ips: *ips,
                        })
                        .collect(),
                },
            );
        });
    }

    pub fn add_cluster(&self, cluster: DvmCluster) {
        self.with_state(|s| s.clusters.push(cluster));
    }

    /// Register a docker host and its CMDB topology.
    pub fn add_dvm_host(&self, host: DvmHost, rack: &str, module: &str) {
        self.with_state(|s| {
            s.cmdb.insert(
                host.asset_id.clone(),
                HostInfo {
                    asset_id: host.asset_id.clone(),
                    ip: host.ip.clone(),
                    bk_biz_id: 0,
                    region: host.region.clone(),
                    zone: host.zone.clone(),
                    sub_zone: host.zone.clone(),
                    module: module.to_string(),
                    rack: rack.to_string(),
                    device_type: host.device_class.clone(),
                    ..Default::default()
                },
            );
            s.dvm_hosts.push(host);
        });
    }

    pub fn add_cmdb_host(&self, host: HostInfo) {
        self.with_state(|s| {
            s.cmdb.insert(host.asset_id.clone(), host);
        });
    }

    pub fn set_ticket_result(&self, result: TicketResult) {
        self.with_state(|s| {
            s.itsm.insert(result.ticket_id.clone(), result);
        });
    }

    /// Make SOPS tasks touching `ip` finish in the failed state.
    pub fn fail_tasks_for(&self, ip: &str) {
        self.with_state(|s| {
            s.failing_task_ips.insert(ip.to_string());
        });
    }

    /// Orders created from now on report Running for `polls` queries before finishing.
    pub fn set_pending_polls(&self, polls: u32) {
        self.with_state(|s| s.pending_polls = polls);
    }

    /// Queue errors returned by the next CVM create calls, in order.
    pub fn push_cvm_create_failure(&self, err: RemoteError) {
        self.with_state(|s| s.cvm_create_failures.push(err));
    }

    /// Pre-seed a SOPS task, as if created by a previous process.
    pub fn seed_task(&self, task: SopsTask) {
        self.with_state(|s| s.tasks.push(task));
    }

    /// Pre-seed a task that still shows up in listings but whose detail query fails.
    pub fn seed_stale_task(&self, task: SopsTask) {
        self.with_state(|s| {
            s.stale_tasks.insert(task.task_id.clone());
            s.tasks.push(task);
        });
    }

    pub fn counters(&self) -> MockCounters {
        self.with_state(|s| s.counters.clone())
    }

    pub fn host(&self, asset_id: &str) -> Option<HostInfo> {
        self.with_state(|s| s.cmdb.get(asset_id).cloned())
    }

    pub fn dvm_host(&self, ip: &str) -> Option<DvmHost> {
        self.with_state(|s| s.dvm_hosts.iter().find(|h| h.ip == ip).cloned())
    }

    /// Move a host to another business behind the orchestrator's back.
    pub fn set_host_biz(&self, asset_id: &str, bk_biz_id: i64) {
        self.with_state(|s| {
            if let Some(h) = s.cmdb.get_mut(asset_id) {
                h.bk_biz_id = bk_biz_id;
            }
        });
    }

    /// Register an already finished CVM order, as if created before a restart.
    pub fn seed_cvm_order(&self, order_id: &str, instances: Vec<ProvisionedInstance>) {
        self.with_state(|s| {
            s.cvm_orders.insert(
                order_id.to_string(),
                MockOrder {
                    remaining_polls: 0,
                    state: OrderState::Success,
                    instances,
                },
            );
        });
    }
}

impl MockState {
    fn next(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    fn new_order(&self, instances: Vec<ProvisionedInstance>) -> MockOrder {
        MockOrder {
            remaining_polls: self.pending_polls,
            state: OrderState::Success,
            instances,
        }
    }
}

fn poll(orders: &mut HashMap<String, MockOrder>, order_id: &str) -> Result<RemoteOrder> {
    let order = orders
        .get_mut(order_id)
        .ok_or_else(|| RemoteError::NotFound(format!("order {}", order_id)))?;
    let state = if order.remaining_polls > 0 {
        order.remaining_polls -= 1;
        OrderState::Running
    } else {
        order.state
    };
    Ok(RemoteOrder {
        order_id: order_id.to_string(),
        state,
        message: String::new(),
        link: format!("https://mock.local/orders/{}", order_id),
    })
}

fn instances_of(orders: &HashMap<String, MockOrder>, order_id: &str) -> Vec<ProvisionedInstance> {
    orders
        .get(order_id)
        .filter(|o| o.remaining_polls == 0)
        .map(|o| o.instances.clone())
        .unwrap_or_default()
}

#[async_trait]
impl CvmClient for MockCloud {
    async fn list_zones(&self, region: &str, _device_type: &str) -> Result<Vec<String>> {
        Ok(self.with_state(|s| {
            s.zones
                .keys()
                .filter(|(r, _)| r == region)
                .map(|(_, z)| z.clone())
                .collect()
        }))
    }

    async fn zone_capacity(
        &self,
        region: &str,
        _device_type: &str,
        zones: &[String],
    ) -> Result<Vec<ZoneCapacity>> {
        Ok(self.with_state(|s| {
            zones
                .iter()
                .filter_map(|z| {
                    s.zones
                        .get(&(region.to_string(), z.clone()))
                        .map(|mz| ZoneCapacity {
                            zone: z.clone(),
                            max_count: mz.capacity,
                        })
                })
                .collect()
        }))
    }

    async fn list_subnets(&self, region: &str, zone: &str, _vpc_id: &str) -> Result<Vec<Subnet>> {
        Ok(self.with_state(|s| {
            s.zones
                .get(&(region.to_string(), zone.to_string()))
                .map(|z| z.subnets.clone())
                .unwrap_or_default()
        }))
    }

    async fn create_order(&self, req: &CvmCreateRequest) -> Result<String> {
        self.with_state(|s| {
            s.counters.cvm_create += 1;
            if !s.cvm_create_failures.is_empty() {
                return Err(s.cvm_create_failures.remove(0));
            }
            let zone_idx = s
                .zones
                .keys()
                .position(|(r, z)| r == &req.region && z == &req.zone)
                .ok_or_else(|| RemoteError::NotFound(format!("zone {}", req.zone)))?;
            let zone = s
                .zones
                .get_mut(&(req.region.clone(), req.zone.clone()))
                .ok_or_else(|| RemoteError::NotFound(format!("zone {}", req.zone)))?;
            if zone.capacity < req.count {
                return Err(RemoteError::NoCapacity(format!(
                    "zone {} has {} left, asked {}",
                    req.zone, zone.capacity, req.count
                )));
            }
            zone.capacity -= req.count;
            if let Some(subnet) = zone
                .subnets
                .iter_mut()
                .find(|sn| sn.subnet_id == req.subnet_id)
            {
                subnet.available_ips = subnet.available_ips.saturating_sub(req.count);
            }
            let mut instances = Vec::new();
            for _ in 0..req.count {
                let n = s.next();
                instances.push(ProvisionedInstance {
                    instance_id: format!("ins-{:06}", n),
                    asset_id: format!("TC{:08}", n),
                    ip: format!("10.{}.{}.{}", zone_idx, n / 250, n % 250 + 1),
                    zone: req.zone.clone(),
                    host_ip: String::new(),
                });
            }
            let order_id = format!("cvm-{}", s.next());
            let order = s.new_order(instances);
            s.cvm_orders.insert(order_id.clone(), order);
            Ok(order_id)
        })
    }

    async fn query_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.with_state(|s| poll(&mut s.cvm_orders, order_id))
    }

    async fn list_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        Ok(self.with_state(|s| instances_of(&s.cvm_orders, order_id)))
    }
}

#[async_trait]
impl DvmClient for MockCloud {
    async fn list_clusters(&self) -> Result<Vec<DvmCluster>> {
        Ok(self.with_state(|s| s.clusters.clone()))
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<DvmHost>> {
        Ok(self.with_state(|s| {
            s.dvm_hosts
                .iter()
                .filter(|h| h.cluster_id == filter.cluster_id)
                .filter(|h| filter.region.is_empty() || h.region == filter.region)
                .cloned()
                .collect()
        }))
    }

    async fn create_order(&self, req: &DvmCreateRequest) -> Result<String> {
        self.with_state(|s| {
            s.counters.dvm_create += 1;
            let host = s
                .dvm_hosts
                .iter_mut()
                .find(|h| h.ip == req.host_ip)
                .ok_or_else(|| RemoteError::NotFound(format!("host {}", req.host_ip)))?;
            if host.scheduled_vms + req.count > 3 {
                return Err(RemoteError::Rejected {
                    code: "VirtualRatioExceeded".to_string(),
                    message: format!("host {} already runs {} vms", host.ip, host.scheduled_vms),
                });
            }
            host.scheduled_vms += req.count;
            host.used_cores += req.cores * req.count;
            host.used_mem_gb += req.mem_gb * req.count;
            let host_ip = host.ip.clone();
            let zone = host.zone.clone();
            let mut instances = Vec::new();
            for _ in 0..req.count {
                let n = s.next();
                instances.push(ProvisionedInstance {
                    instance_id: format!("dvm-{:06}", n),
                    asset_id: format!("DVM{:08}", n),
                    ip: format!("172.16.{}.{}", n / 250, n % 250 + 1),
                    zone: zone.clone(),
                    host_ip: host_ip.clone(),
                });
            }
            let order_id = format!("dvm-order-{}", s.next());
            let order = s.new_order(instances);
            s.dvm_orders.insert(order_id.clone(), order);
            Ok(order_id)
        })
    }

    async fn query_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.with_state(|s| poll(&mut s.dvm_orders, order_id))
    }

    async fn list_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        Ok(self.with_state(|s| instances_of(&s.dvm_orders, order_id)))
    }
}

#[async_trait]
impl CmdbClient for MockCloud {
    async fn get_host_info_by_ip(&self, ips: &[String]) -> Result<Vec<HostInfo>> {
        Ok(self.with_state(|s| {
            s.cmdb
                .values()
                .filter(|h| ips.contains(&h.ip))
                .cloned()
                .collect()
        }))
    }

    async fn get_host_info_by_asset(&self, asset_ids: &[String]) -> Result<Vec<HostInfo>> {
        Ok(self.with_state(|s| {
            asset_ids
                .iter()
                .filter_map(|a| s.cmdb.get(a).cloned())
                .collect()
        }))
    }

    async fn get_host_biz_ids(&self, asset_ids: &[String]) -> Result<Vec<HostBiz>> {
        Ok(self.with_state(|s| {
            asset_ids
                .iter()
                .filter_map(|a| s.cmdb.get(a))
                .map(|h| HostBiz {
                    asset_id: h.asset_id.clone(),
                    bk_biz_id: h.bk_biz_id,
                })
                .collect()
        }))
    }

    async fn list_biz_host(&self, bk_biz_id: i64) -> Result<Vec<HostInfo>> {
        Ok(self.with_state(|s| {
            s.cmdb
                .values()
                .filter(|h| h.bk_biz_id == bk_biz_id)
                .cloned()
                .collect()
        }))
    }

    async fn list_pool_hosts(&self, filter: &PoolHostFilter) -> Result<Vec<HostInfo>> {
        Ok(self.with_state(|s| {
            s.cmdb
                .values()
                .filter(|h| filter.matches(h))
                .cloned()
                .collect()
        }))
    }

    async fn add_host(&self, hosts: &[ProvisionedInstance], bk_biz_id: i64) -> Result<()> {
        self.with_state(|s| {
            s.counters.cmdb_add += 1;
            for h in hosts {
                let entry = s.cmdb.entry(h.asset_id.clone()).or_insert_with(|| HostInfo {
                    asset_id: h.asset_id.clone(),
                    ip: h.ip.clone(),
                    zone: h.zone.clone(),
                    sub_zone: h.zone.clone(),
                    ..Default::default()
                });
                entry.bk_biz_id = bk_biz_id;
            }
        });
        Ok(())
    }

    async fn transfer_host(&self, asset_ids: &[String], from_biz: i64, to_biz: i64) -> Result<()> {
        self.with_state(|s| {
            s.counters.cmdb_transfer += 1;
            for a in asset_ids {
                let host = s
                    .cmdb
                    .get(a)
                    .ok_or_else(|| RemoteError::NotFound(format!("host {}", a)))?;
                if host.bk_biz_id != from_biz {
                    return Err(RemoteError::Rejected {
                        code: "HostNotInBiz".to_string(),
                        message: format!("host {} is in biz {}", a, host.bk_biz_id),
                    });
                }
            }
            for a in asset_ids {
                if let Some(h) = s.cmdb.get_mut(a) {
                    h.bk_biz_id = to_biz;
                }
            }
            Ok(())
        })
    }

    async fn update_host_operator(&self, asset_ids: &[String], operator: &str) -> Result<()> {
        self.with_state(|s| {
            for a in asset_ids {
                if let Some(h) = s.cmdb.get_mut(a) {
                    h.operator = operator.to_string();
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl PoolClient for MockCloud {
    async fn create_recall_order(&self, req: &RecallRequest) -> Result<String> {
        self.with_state(|s| {
            s.counters.recall_create += 1;
            let mut instances = Vec::new();
            for _ in 0..req.count {
                let n = s.next();
                instances.push(ProvisionedInstance {
                    instance_id: format!("pool-{:06}", n),
                    asset_id: format!("POOL{:08}", n),
                    ip: format!("192.168.{}.{}", n / 250, n % 250 + 1),
                    zone: req.zone.clone(),
                    host_ip: String::new(),
                });
            }
            let order_id = format!("recall-{}", s.next());
            let order = s.new_order(instances);
            s.recall_orders.insert(order_id.clone(), order);
            Ok(order_id)
        })
    }

    async fn query_recall_order(&self, order_id: &str) -> Result<RemoteOrder> {
        self.with_state(|s| poll(&mut s.recall_orders, order_id))
    }

    async fn list_recalled_instances(&self, order_id: &str) -> Result<Vec<ProvisionedInstance>> {
        Ok(self.with_state(|s| instances_of(&s.recall_orders, order_id)))
    }
}

#[async_trait]
impl ItsmClient for MockCloud {
    async fn get_ticket_results(&self, ticket_ids: &[String]) -> Result<Vec<TicketResult>> {
        self.with_state(|s| {
            s.counters.itsm_queries += 1;
            s.counters.itsm_max_batch = s.counters.itsm_max_batch.max(ticket_ids.len());
            if ticket_ids.len() > crate::ITSM_BATCH_LIMIT {
                return Err(RemoteError::Rejected {
                    code: "TooManyTickets".to_string(),
                    message: format!("{} ids in one query", ticket_ids.len()),
                });
            }
            Ok(ticket_ids
                .iter()
                .filter_map(|id| s.itsm.get(id).cloned())
                .collect())
        })
    }
}

#[async_trait]
impl SopsClient for MockCloud {
    async fn create_task(&self, req: &CreateTask) -> Result<SopsTask> {
        Ok(self.with_state(|s| {
            s.counters.sops_create += 1;
            let n = s.next();
            let task = SopsTask {
                task_id: format!("task-{}", n),
                name: req.name.clone(),
                bk_biz_id: req.bk_biz_id,
                link: format!("https://mock.local/sops/{}", n),
            };
            s.tasks.push(task.clone());
            task
        }))
    }

    async fn get_task_list(&self, bk_biz_id: i64, name: &str) -> Result<Vec<SopsTask>> {
        Ok(self.with_state(|s| {
            s.tasks
                .iter()
                .filter(|t| t.bk_biz_id == bk_biz_id && t.name == name)
                .cloned()
                .collect()
        }))
    }

    async fn get_task_detail(&self, _bk_biz_id: i64, task_id: &str) -> Result<TaskDetail> {
        self.with_state(|s| {
            let task = s
                .tasks
                .iter()
                .find(|t| t.task_id == task_id)
                .filter(|t| !s.stale_tasks.contains(&t.task_id))
                .ok_or_else(|| RemoteError::NotFound(format!("task {}", task_id)))?;
            let failing = s.failing_task_ips.iter().any(|ip| task.name.ends_with(ip));
            Ok(TaskDetail {
                task_id: task.task_id.clone(),
                state: if failing {
                    TaskState::Failed
                } else {
                    TaskState::Finished
                },
                link: task.link.clone(),
                message: String::new(),
            })
        })
    }
}
