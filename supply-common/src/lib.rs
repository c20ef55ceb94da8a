use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod device_stage;

pub use device_stage::{DeviceStage, StageTransitionError};

/// Zone placeholder asking the generator to spread CVMs across campuses.
pub const SEPARATE_CAMPUS_ZONE: &str = "cvm_separate_campus";

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketStage {
    Uncommit,
    Audit,
    Terminate,
    Running,
    Suspend,
    Done,
}

impl TicketStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStage::Uncommit => "UNCOMMIT",
            TicketStage::Audit => "AUDIT",
            TicketStage::Terminate => "TERMINATE",
            TicketStage::Running => "RUNNING",
            TicketStage::Suspend => "SUSPEND",
            TicketStage::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStage::Done | TicketStage::Terminate)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    WaitForMatch,
    Matching,
    MatchedSome,
    Paused,
    Done,
    Terminate,
    GracefulTerminate,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::WaitForMatch => "WAIT",
            OrderStatus::Matching => "MATCHING",
            OrderStatus::MatchedSome => "MATCHED_SOME",
            OrderStatus::Paused => "PAUSED",
            OrderStatus::Done => "DONE",
            OrderStatus::Terminate => "TERMINATE",
            OrderStatus::GracefulTerminate => "GRACEFUL_TERMINATE",
        }
    }

    /// No further matching will ever happen for the order.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Done | OrderStatus::Terminate | OrderStatus::GracefulTerminate
        )
    }

    /// Statuses an operator may (re)start matching from.
    pub fn can_restart(&self) -> bool {
        matches!(
            self,
            OrderStatus::WaitForMatch | OrderStatus::MatchedSome | OrderStatus::Paused
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    #[serde(rename = "IDCPM")]
    IdcPm,
    #[serde(rename = "QCLOUDCVM")]
    QcloudCvm,
    #[serde(rename = "IDCDVM")]
    IdcDvm,
    #[serde(rename = "QCLOUDDVM")]
    QcloudDvm,
    #[serde(rename = "POOL")]
    Pool,
    #[serde(rename = "UpgradeCVM")]
    UpgradeCvm,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::IdcPm => "IDCPM",
            ResourceType::QcloudCvm => "QCLOUDCVM",
            ResourceType::IdcDvm => "IDCDVM",
            ResourceType::QcloudDvm => "QCLOUDDVM",
            ResourceType::Pool => "POOL",
            ResourceType::UpgradeCvm => "UpgradeCVM",
        }
    }

    pub fn is_cvm(&self) -> bool {
        matches!(self, ResourceType::QcloudCvm | ResourceType::UpgradeCvm)
    }

    pub fn is_dvm(&self) -> bool {
        matches!(self, ResourceType::IdcDvm | ResourceType::QcloudDvm)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepName {
    Generate,
    Init,
    DiskCheck,
    Deliver,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::Generate,
        StepName::Init,
        StepName::DiskCheck,
        StepName::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Generate => "GENERATE",
            StepName::Init => "INIT",
            StepName::DiskCheck => "DISK_CHECK",
            StepName::Deliver => "DELIVER",
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            StepName::Generate => 1,
            StepName::Init => 2,
            StepName::DiskCheck => 3,
            StepName::Deliver => 4,
        }
    }

    /// The step that must be Success before this one may run.
    /// DiskCheck is skipped when it is not enabled for the order.
    pub fn predecessor(&self, disk_check_enabled: bool) -> Option<StepName> {
        match self {
            StepName::Generate => None,
            StepName::Init => Some(StepName::Generate),
            StepName::DiskCheck => Some(StepName::Init),
            StepName::Deliver if disk_check_enabled => Some(StepName::DiskCheck),
            StepName::Deliver => Some(StepName::Init),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    Init,
    Handling,
    Success,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed)
    }
}

/// Status of one provisioning batch. Numeric codes match the persisted legacy values.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerateStatus {
    Init,
    Success,
    Handling,
    Failed,
    Suspend,
}

impl GenerateStatus {
    pub fn code(&self) -> i32 {
        match self {
            GenerateStatus::Init => -1,
            GenerateStatus::Success => 0,
            GenerateStatus::Handling => 1,
            GenerateStatus::Failed => 2,
            GenerateStatus::Suspend => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(GenerateStatus::Init),
            0 => Some(GenerateStatus::Success),
            1 => Some(GenerateStatus::Handling),
            2 => Some(GenerateStatus::Failed),
            3 => Some(GenerateStatus::Suspend),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, GenerateStatus::Init | GenerateStatus::Handling)
    }
}

/// Status of a per-device init / disk-check / deliver record.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Init,
    Success,
    Handling,
    Failed,
}

impl RecordStatus {
    pub fn code(&self) -> i32 {
        match self {
            RecordStatus::Init => -1,
            RecordStatus::Success => 0,
            RecordStatus::Handling => 1,
            RecordStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Init,
    DiskCheck,
    Deliver,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Init => "init",
            StageKind::DiskCheck => "diskcheck",
            StageKind::Deliver => "deliver",
        }
    }

    pub fn step(&self) -> StepName {
        match self {
            StageKind::Init => StepName::Init,
            StageKind::DiskCheck => StepName::DiskCheck,
            StageKind::Deliver => StepName::Deliver,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AntiAffinityLevel {
    #[default]
    None,
    Rack,
    Module,
    Campus,
}

// --- Value objects ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RecallLine {
    pub device_type: String,
    #[serde(default)]
    pub zone: String,
    pub replicas: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceSpec {
    pub region: String,
    #[serde(default)]
    pub zone: String,
    pub device_type: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub disk_type: String,
    #[serde(default)]
    pub disk_size_gb: u32,
    #[serde(default)]
    pub charge_type: String,
    #[serde(default)]
    pub charge_months: u32,
    #[serde(default)]
    pub vpc: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub anti_affinity: AntiAffinityLevel,
    // physical machine filters
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub raid_type: String,
    #[serde(default)]
    pub isp: String,
    // docker vm placement
    #[serde(default)]
    pub kernel_version: String,
    #[serde(default)]
    pub recall_lines: Vec<RecallLine>,
}

impl ResourceSpec {
    pub fn is_separate_campus(&self) -> bool {
        self.zone == SEPARATE_CAMPUS_ZONE
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SuborderRequest {
    pub resource_type: ResourceType,
    pub spec: ResourceSpec,
    pub replicas: u32,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub enable_disk_check: bool,
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApplyTicket {
    pub order_id: u64,
    pub bk_biz_id: i64,
    pub user: String,
    pub stage: TicketStage,
    pub suborders: Vec<SuborderRequest>,
    pub itsm_ticket_id: Option<String>,
    pub itsm_url: Option<String>,
    pub approved_by: Option<String>,
    pub approve_message: Option<String>,
    pub approve_at: Option<DateTime<Utc>>,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl ApplyTicket {
    pub fn new(order_id: u64, bk_biz_id: i64, user: &str, suborders: Vec<SuborderRequest>) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            bk_biz_id,
            user: user.to_string(),
            stage: TicketStage::Uncommit,
            suborders,
            itsm_ticket_id: None,
            itsm_url: None,
            approved_by: None,
            approve_message: None,
            approve_at: None,
            create_at: now,
            update_at: now,
        }
    }

    /// Suborder ids are `{order_id}-{n}` with n starting at 1.
    pub fn suborder_id(&self, index: usize) -> String {
        format!("{}-{}", self.order_id, index + 1)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApplyOrder {
    pub suborder_id: String,
    pub order_id: u64,
    pub bk_biz_id: i64,
    pub user: String,
    pub resource_type: ResourceType,
    pub spec: ResourceSpec,
    pub status: OrderStatus,
    pub stage: TicketStage,
    pub total: u32,
    pub success_num: u32,
    pub pending_num: u32,
    pub enable_disk_check: bool,
    pub remark: String,
    pub message: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl ApplyOrder {
    pub fn from_request(ticket: &ApplyTicket, index: usize, req: &SuborderRequest) -> Self {
        let now = Utc::now();
        Self {
            suborder_id: ticket.suborder_id(index),
            order_id: ticket.order_id,
            bk_biz_id: ticket.bk_biz_id,
            user: ticket.user.clone(),
            resource_type: req.resource_type,
            spec: req.spec.clone(),
            status: OrderStatus::WaitForMatch,
            stage: TicketStage::Running,
            total: req.replicas,
            success_num: 0,
            pending_num: 0,
            enable_disk_check: req.enable_disk_check,
            remark: req.remark.clone(),
            message: String::new(),
            create_at: now,
            update_at: now,
        }
    }

    /// Steps this order runs through, in order.
    pub fn steps(&self) -> Vec<StepName> {
        StepName::ALL
            .into_iter()
            .filter(|s| *s != StepName::DiskCheck || self.enable_disk_check)
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApplyStep {
    pub suborder_id: String,
    pub step: StepName,
    pub status: StepStatus,
    pub total: u32,
    pub running: u32,
    pub success: u32,
    pub failed: u32,
    pub message: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub update_at: DateTime<Utc>,
}

impl ApplyStep {
    pub fn new(suborder_id: &str, step: StepName, total: u32) -> Self {
        Self {
            suborder_id: suborder_id.to_string(),
            step,
            status: StepStatus::Init,
            total,
            running: 0,
            success: 0,
            failed: 0,
            message: String::new(),
            start_at: None,
            end_at: None,
            update_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerateRecord {
    pub generate_id: u64,
    pub suborder_id: String,
    pub order_id: u64,
    pub resource_type: ResourceType,
    pub status: GenerateStatus,
    pub is_matched: bool,
    pub is_manual_matched: bool,
    pub total_num: u32,
    pub success_num: u32,
    pub success_list: Vec<String>,
    pub task_id: String,
    pub task_link: String,
    pub zone: String,
    pub subnet_id: String,
    /// Snapshot of the remote request, replayed by recovery.
    pub request: serde_json::Value,
    pub message: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl GenerateRecord {
    pub fn new(generate_id: u64, order: &ApplyOrder, total_num: u32) -> Self {
        let now = Utc::now();
        Self {
            generate_id,
            suborder_id: order.suborder_id.clone(),
            order_id: order.order_id,
            resource_type: order.resource_type,
            status: GenerateStatus::Init,
            is_matched: false,
            is_manual_matched: false,
            total_num,
            success_num: 0,
            success_list: vec![],
            task_id: String::new(),
            task_link: String::new(),
            zone: String::new(),
            subnet_id: String::new(),
            request: serde_json::Value::Null,
            message: String::new(),
            create_at: now,
            update_at: now,
        }
    }

    /// Successful batch whose devices have not yet been folded into order progress.
    pub fn needs_matching(&self) -> bool {
        self.status == GenerateStatus::Success && !self.is_matched
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: Uuid,
    pub suborder_id: String,
    pub generate_id: u64,
    pub order_id: u64,
    pub bk_biz_id: i64,
    pub ip: String,
    pub asset_id: String,
    pub instance_id: String,
    pub device_type: String,
    pub zone: String,
    pub sub_zone: String,
    pub module: String,
    pub rack: String,
    /// Physical parent for docker VMs.
    pub host_ip: String,
    pub stage: DeviceStage,
    pub init_task: String,
    pub disk_check_task: String,
    pub deliver_task: String,
    pub is_manual_matched: bool,
    pub operator: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(order: &ApplyOrder, generate_id: u64, ip: &str, asset_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            suborder_id: order.suborder_id.clone(),
            generate_id,
            order_id: order.order_id,
            bk_biz_id: order.bk_biz_id,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            instance_id: String::new(),
            device_type: order.spec.device_type.clone(),
            zone: String::new(),
            sub_zone: String::new(),
            module: String::new(),
            rack: String::new(),
            host_ip: String::new(),
            stage: DeviceStage::Generated,
            init_task: String::new(),
            disk_check_task: String::new(),
            deliver_task: String::new(),
            is_manual_matched: false,
            operator: String::new(),
            create_at: now,
            update_at: now,
        }
    }

    /// Value of the topology dimension used for anti-affinity spreading.
    pub fn dimension(&self, level: AntiAffinityLevel) -> &str {
        match level {
            AntiAffinityLevel::None => "",
            AntiAffinityLevel::Rack => &self.rack,
            AntiAffinityLevel::Module => &self.module,
            AntiAffinityLevel::Campus => campus(&self.zone, &self.sub_zone),
        }
    }
}

/// Campus a machine counts under: the CMDB sub zone when known, the cloud zone otherwise.
pub fn campus<'a>(zone: &'a str, sub_zone: &'a str) -> &'a str {
    if sub_zone.is_empty() {
        zone
    } else {
        sub_zone
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageRecord {
    pub kind: StageKind,
    pub suborder_id: String,
    pub ip: String,
    pub asset_id: String,
    pub bk_biz_id: i64,
    pub status: RecordStatus,
    pub task_id: String,
    pub task_link: String,
    pub message: String,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(kind: StageKind, device: &DeviceInfo) -> Self {
        let now = Utc::now();
        Self {
            kind,
            suborder_id: device.suborder_id.clone(),
            ip: device.ip.clone(),
            asset_id: device.asset_id.clone(),
            bk_biz_id: device.bk_biz_id,
            status: RecordStatus::Init,
            task_id: String::new(),
            task_link: String::new(),
            message: String::new(),
            create_at: now,
            update_at: now,
        }
    }
}
