//! Persistence gateway over tickets, orders, steps, generate records, devices and
//! per-device stage records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use supply_common::{
    ApplyOrder, ApplyStep, ApplyTicket, DeviceInfo, DeviceStage, GenerateRecord, GenerateStatus,
    OrderStatus, StageKind, StageRecord, TicketStage,
};

pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("conflicting write on {entity}: {key}")]
    Conflict { entity: &'static str, key: String },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug, Default)]
pub struct TicketFilter {
    /// Empty matches every stage.
    pub stages: Vec<TicketStage>,
    /// Inclusive.
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive.
    pub created_before: Option<DateTime<Utc>>,
}

impl TicketFilter {
    pub fn matches(&self, t: &ApplyTicket) -> bool {
        (self.stages.is_empty() || self.stages.contains(&t.stage))
            && self.created_after.map_or(true, |a| t.create_at >= a)
            && self.created_before.map_or(true, |b| t.create_at < b)
    }
}

#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub order_id: Option<u64>,
    pub statuses: Vec<OrderStatus>,
    pub stages: Vec<TicketStage>,
}

impl OrderFilter {
    pub fn matches(&self, o: &ApplyOrder) -> bool {
        self.order_id.map_or(true, |id| o.order_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&o.status))
            && (self.stages.is_empty() || self.stages.contains(&o.stage))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    pub suborder_id: String,
    pub statuses: Vec<GenerateStatus>,
    pub is_matched: Option<bool>,
}

impl RecordFilter {
    pub fn suborder(suborder_id: &str) -> Self {
        Self {
            suborder_id: suborder_id.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, r: &GenerateRecord) -> bool {
        r.suborder_id == self.suborder_id
            && (self.statuses.is_empty() || self.statuses.contains(&r.status))
            && self.is_matched.map_or(true, |m| r.is_matched == m)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceFilter {
    pub suborder_id: String,
    pub generate_ids: Vec<u64>,
    pub stages: Vec<DeviceStage>,
}

impl DeviceFilter {
    pub fn suborder(suborder_id: &str) -> Self {
        Self {
            suborder_id: suborder_id.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, d: &DeviceInfo) -> bool {
        d.suborder_id == self.suborder_id
            && (self.generate_ids.is_empty() || self.generate_ids.contains(&d.generate_id))
            && (self.stages.is_empty() || self.stages.contains(&d.stage))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Monotonic counter, starting at 1 for a new name.
    async fn next_sequence(&self, name: &str) -> StoreResult<u64>;

    async fn insert_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()>;
    async fn get_ticket(&self, order_id: u64) -> StoreResult<Option<ApplyTicket>>;
    async fn update_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()>;
    async fn find_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<ApplyTicket>>;

    async fn insert_order(&self, order: &ApplyOrder) -> StoreResult<()>;
    async fn get_order(&self, suborder_id: &str) -> StoreResult<Option<ApplyOrder>>;
    /// Overwrites everything but `status`, which only moves through
    /// `transition_order_status`.
    async fn update_order(&self, order: &ApplyOrder) -> StoreResult<()>;
    async fn find_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<ApplyOrder>>;
    /// Compare-and-set on the order status. Returns false when the current status is not in
    /// `from` (someone else got there first).
    async fn transition_order_status(
        &self,
        suborder_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool>;

    async fn upsert_step(&self, step: &ApplyStep) -> StoreResult<()>;
    /// Ordered by step ordinal.
    async fn find_steps(&self, suborder_id: &str) -> StoreResult<Vec<ApplyStep>>;

    async fn insert_record(&self, record: &GenerateRecord) -> StoreResult<()>;
    async fn get_record(&self, generate_id: u64) -> StoreResult<Option<GenerateRecord>>;
    async fn update_record(&self, record: &GenerateRecord) -> StoreResult<()>;
    /// Ordered by generate id.
    async fn find_records(&self, filter: &RecordFilter) -> StoreResult<Vec<GenerateRecord>>;

    /// Fails with `Duplicate` if any device shares `(suborder_id, ip)` or
    /// `(suborder_id, asset_id)` with a stored one or with another in the slice.
    async fn insert_devices(&self, devices: &[DeviceInfo]) -> StoreResult<()>;
    async fn update_device(&self, device: &DeviceInfo) -> StoreResult<()>;
    async fn find_devices(&self, filter: &DeviceFilter) -> StoreResult<Vec<DeviceInfo>>;

    async fn count_devices(&self, filter: &DeviceFilter) -> StoreResult<u64> {
        Ok(self.find_devices(filter).await?.len() as u64)
    }

    /// Persist `devices` and overwrite `record` in one atomic unit.
    async fn commit_generated(
        &self,
        record: &GenerateRecord,
        devices: &[DeviceInfo],
    ) -> StoreResult<()>;

    async fn get_stage_record(
        &self,
        kind: StageKind,
        suborder_id: &str,
        ip: &str,
    ) -> StoreResult<Option<StageRecord>>;
    async fn upsert_stage_record(&self, record: &StageRecord) -> StoreResult<()>;
    async fn find_stage_records(
        &self,
        kind: StageKind,
        suborder_id: &str,
    ) -> StoreResult<Vec<StageRecord>>;

    async fn count_orders_by_status(&self) -> StoreResult<Vec<(OrderStatus, u64)>>;
}

/// Reject devices clashing with each other or with `existing`.
pub(crate) fn check_device_keys<'a>(
    existing: impl Iterator<Item = &'a DeviceInfo>,
    incoming: &[DeviceInfo],
) -> StoreResult<()> {
    use std::collections::HashSet;
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for d in existing {
        seen.insert((d.suborder_id.clone(), format!("ip:{}", d.ip)));
        if !d.asset_id.is_empty() {
            seen.insert((d.suborder_id.clone(), format!("asset:{}", d.asset_id)));
        }
    }
    for d in incoming {
        let ip_key = (d.suborder_id.clone(), format!("ip:{}", d.ip));
        if !seen.insert(ip_key) {
            return Err(StoreError::Duplicate {
                entity: "device",
                key: format!("{}/{}", d.suborder_id, d.ip),
            });
        }
        if !d.asset_id.is_empty()
            && !seen.insert((d.suborder_id.clone(), format!("asset:{}", d.asset_id)))
        {
            return Err(StoreError::Duplicate {
                entity: "device",
                key: format!("{}/{}", d.suborder_id, d.asset_id),
            });
        }
    }
    Ok(())
}
