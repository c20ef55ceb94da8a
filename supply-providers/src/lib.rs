use async_trait::async_trait;

/// ITSM accepts at most this many ticket ids per result query.
pub const ITSM_BATCH_LIMIT: usize = 100;

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Failure of a call to a downstream provisioning service.
///
/// Only `Transient` is worth retrying; everything else is an answer from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("no capacity: {0}")]
    NoCapacity(String),
    #[error("sold out: {0}")]
    SoldOut(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by remote ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("cannot decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteError::Transient(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, RemoteError::NoCapacity(_) | RemoteError::SoldOut(_))
    }

    /// Map a remote error code to the local taxonomy.
    pub fn from_code(code: &str, message: &str) -> Self {
        let upper = code.to_ascii_uppercase();
        if upper.contains("SOLDOUT") || upper.contains("SOLD_OUT") {
            RemoteError::SoldOut(message.to_string())
        } else if upper.contains("INSUFFICIENT") || upper.contains("NOCAPACITY") {
            RemoteError::NoCapacity(message.to_string())
        } else if upper.contains("NOTFOUND") || upper.contains("NOT_FOUND") {
            RemoteError::NotFound(message.to_string())
        } else if upper.contains("TIMEOUT")
            || upper.contains("INTERNALERROR")
            || upper.contains("REQUESTLIMIT")
        {
            RemoteError::Transient(format!("{}: {}", code, message))
        } else {
            RemoteError::Rejected {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
    }
}

#[async_trait]
pub trait CvmClient: Send + Sync {
    async fn list_zones(&self, region: &str, device_type: &str) -> Result<Vec<String>>;
    async fn zone_capacity(
        &self,
        region: &str,
        device_type: &str,
        zones: &[String],
    ) -> Result<Vec<inventory::ZoneCapacity>>;
    async fn list_subnets(
        &self,
        region: &str,
        zone: &str,
        vpc_id: &str,
    ) -> Result<Vec<inventory::Subnet>>;
    /// Returns the external order id.
    async fn create_order(&self, req: &inventory::CvmCreateRequest) -> Result<String>;
    async fn query_order(&self, order_id: &str) -> Result<inventory::RemoteOrder>;
    async fn list_instances(&self, order_id: &str) -> Result<Vec<inventory::ProvisionedInstance>>;
}

#[async_trait]
pub trait DvmClient: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<inventory::DvmCluster>>;
    async fn list_hosts(&self, filter: &inventory::HostFilter) -> Result<Vec<inventory::DvmHost>>;
    async fn create_order(&self, req: &inventory::DvmCreateRequest) -> Result<String>;
    async fn query_order(&self, order_id: &str) -> Result<inventory::RemoteOrder>;
    async fn list_instances(&self, order_id: &str) -> Result<Vec<inventory::ProvisionedInstance>>;
}

#[async_trait]
pub trait CmdbClient: Send + Sync {
    async fn get_host_info_by_ip(&self, ips: &[String]) -> Result<Vec<inventory::HostInfo>>;
    async fn get_host_info_by_asset(&self, asset_ids: &[String])
        -> Result<Vec<inventory::HostInfo>>;
    async fn get_host_biz_ids(&self, asset_ids: &[String]) -> Result<Vec<inventory::HostBiz>>;
    async fn list_biz_host(&self, bk_biz_id: i64) -> Result<Vec<inventory::HostInfo>>;
    async fn list_pool_hosts(
        &self,
        filter: &inventory::PoolHostFilter,
    ) -> Result<Vec<inventory::HostInfo>>;
    /// Register freshly provisioned hosts into `bk_biz_id`.
    async fn add_host(
        &self,
        hosts: &[inventory::ProvisionedInstance],
        bk_biz_id: i64,
    ) -> Result<()>;
    async fn transfer_host(&self, asset_ids: &[String], from_biz: i64, to_biz: i64) -> Result<()>;
    async fn update_host_operator(&self, asset_ids: &[String], operator: &str) -> Result<()>;
}

#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn create_recall_order(&self, req: &inventory::RecallRequest) -> Result<String>;
    async fn query_recall_order(&self, order_id: &str) -> Result<inventory::RemoteOrder>;
    async fn list_recalled_instances(
        &self,
        order_id: &str,
    ) -> Result<Vec<inventory::ProvisionedInstance>>;
}

#[async_trait]
pub trait ItsmClient: Send + Sync {
    /// At most [`ITSM_BATCH_LIMIT`] ids per call; unknown ids are omitted from the answer.
    async fn get_ticket_results(&self, ticket_ids: &[String])
        -> Result<Vec<inventory::TicketResult>>;
}

#[async_trait]
pub trait SopsClient: Send + Sync {
    async fn create_task(&self, req: &inventory::CreateTask) -> Result<inventory::SopsTask>;
    async fn get_task_list(&self, bk_biz_id: i64, name: &str)
        -> Result<Vec<inventory::SopsTask>>;
    async fn get_task_detail(&self, bk_biz_id: i64, task_id: &str)
        -> Result<inventory::TaskDetail>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum OrderState {
        Running,
        Success,
        Failed,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RemoteOrder {
        pub order_id: String,
        pub state: OrderState,
        #[serde(default)]
        pub message: String,
        #[serde(default)]
        pub link: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ZoneCapacity {
        pub zone: String,
        pub max_count: u32,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct Subnet {
        pub subnet_id: String,
        pub zone: String,
        pub vpc_id: String,
        pub available_ips: u32,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct CvmCreateRequest {
        pub region: String,
        pub zone: String,
        pub device_type: String,
        pub image_id: String,
        pub disk_type: String,
        pub disk_size_gb: u32,
        pub charge_type: String,
        pub charge_months: u32,
        pub vpc_id: String,
        pub subnet_id: String,
        pub count: u32,
        pub remark: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct ProvisionedInstance {
        pub instance_id: String,
        pub asset_id: String,
        pub ip: String,
        #[serde(default)]
        pub zone: String,
        #[serde(default)]
        pub host_ip: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DvmCluster {
        pub cluster_id: String,
        pub region: String,
        /// "IDC" or "QCLOUD".
        pub resource_type: String,
        #[serde(default)]
        pub tlinux_version: String,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct HostFilter {
        pub cluster_id: String,
        pub region: String,
        #[serde(default)]
        pub tlinux_version: String,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct DvmHost {
        pub ip: String,
        pub asset_id: String,
        pub cluster_id: String,
        pub region: String,
        pub zone: String,
        pub device_class: String,
        pub kernel_version: String,
        pub total_cores: u32,
        pub used_cores: u32,
        pub total_mem_gb: u32,
        pub used_mem_gb: u32,
        pub scheduled_vms: u32,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct DvmCreateRequest {
        pub cluster_id: String,
        pub host_ip: String,
        pub count: u32,
        pub cores: u32,
        pub mem_gb: u32,
        pub disk_gb: u32,
        pub image_id: String,
        pub network_type: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct HostInfo {
        pub asset_id: String,
        pub ip: String,
        pub bk_biz_id: i64,
        #[serde(default)]
        pub region: String,
        #[serde(default)]
        pub zone: String,
        #[serde(default)]
        pub sub_zone: String,
        #[serde(default)]
        pub module: String,
        #[serde(default)]
        pub rack: String,
        #[serde(default)]
        pub device_type: String,
        #[serde(default)]
        pub os_type: String,
        #[serde(default)]
        pub raid_type: String,
        #[serde(default)]
        pub isp: String,
        #[serde(default)]
        pub operator: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HostBiz {
        pub asset_id: String,
        pub bk_biz_id: i64,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct PoolHostFilter {
        pub bk_biz_id: i64,
        pub region: String,
        pub zone: String,
        pub device_type: String,
        pub os_type: String,
        pub raid_type: String,
        pub isp: String,
    }

    impl PoolHostFilter {
        /// Empty filter fields match anything.
        pub fn matches(&self, host: &HostInfo) -> bool {
            let eq = |want: &str, have: &str| want.is_empty() || want == have;
            host.bk_biz_id == self.bk_biz_id
                && eq(&self.region, &host.region)
                && eq(&self.zone, &host.zone)
                && eq(&self.device_type, &host.device_type)
                && eq(&self.os_type, &host.os_type)
                && eq(&self.raid_type, &host.raid_type)
                && eq(&self.isp, &host.isp)
        }
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct RecallRequest {
        pub region: String,
        pub zone: String,
        pub device_type: String,
        pub count: u32,
        pub remark: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum ItsmStatus {
        Running,
        Finished,
        Terminated,
        Revoked,
    }

    impl ItsmStatus {
        pub fn is_finished(&self) -> bool {
            !matches!(self, ItsmStatus::Running)
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct TicketResult {
        pub ticket_id: String,
        pub status: ItsmStatus,
        pub approved: bool,
        #[serde(default)]
        pub url: String,
        #[serde(default)]
        pub operator: String,
        #[serde(default)]
        pub message: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CreateTask {
        pub bk_biz_id: i64,
        pub name: String,
        pub template: String,
        pub ips: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct SopsTask {
        pub task_id: String,
        pub name: String,
        pub bk_biz_id: i64,
        #[serde(default)]
        pub link: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum TaskState {
        Created,
        Running,
        Finished,
        Failed,
        Revoked,
    }

    impl TaskState {
        pub fn is_done(&self) -> bool {
            matches!(
                self,
                TaskState::Finished | TaskState::Failed | TaskState::Revoked
            )
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct TaskDetail {
        pub task_id: String,
        pub state: TaskState,
        #[serde(default)]
        pub link: String,
        #[serde(default)]
        pub message: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "gateway")]
pub mod gateway;
