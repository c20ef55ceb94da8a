use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use supply_common::{
    ApplyOrder, ApplyStep, ApplyTicket, DeviceInfo, GenerateRecord, OrderStatus, StageKind,
    StageRecord, StepName,
};
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct Tables {
    sequences: HashMap<String, u64>,
    tickets: BTreeMap<u64, ApplyTicket>,
    orders: BTreeMap<String, ApplyOrder>,
    steps: BTreeMap<(String, StepName), ApplyStep>,
    records: BTreeMap<u64, GenerateRecord>,
    devices: BTreeMap<Uuid, DeviceInfo>,
    stage_records: BTreeMap<(StageKind, String, String), StageRecord>,
}

/// Process-local store. Every call holds one lock, so each operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn next_sequence(&self, name: &str) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let v = t.sequences.entry(name.to_string()).or_insert(0);
        *v += 1;
        Ok(*v)
    }

    async fn insert_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.tickets.contains_key(&ticket.order_id) {
            return Err(StoreError::Duplicate {
                entity: "ticket",
                key: ticket.order_id.to_string(),
            });
        }
        t.tickets.insert(ticket.order_id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, order_id: u64) -> StoreResult<Option<ApplyTicket>> {
        Ok(self.tables.lock().await.tickets.get(&order_id).cloned())
    }

    async fn update_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let slot = t
            .tickets
            .get_mut(&ticket.order_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ticket",
                key: ticket.order_id.to_string(),
            })?;
        *slot = ticket.clone();
        slot.update_at = Utc::now();
        Ok(())
    }

    async fn find_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<ApplyTicket>> {
        let t = self.tables.lock().await;
        Ok(t.tickets
            .values()
            .filter(|x| filter.matches(x))
            .cloned()
            .collect())
    }

    async fn insert_order(&self, order: &ApplyOrder) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.orders.contains_key(&order.suborder_id) {
            return Err(StoreError::Duplicate {
                entity: "order",
                key: order.suborder_id.clone(),
            });
        }
        t.orders.insert(order.suborder_id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, suborder_id: &str) -> StoreResult<Option<ApplyOrder>> {
        Ok(self.tables.lock().await.orders.get(suborder_id).cloned())
    }

    async fn update_order(&self, order: &ApplyOrder) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let slot = t
            .orders
            .get_mut(&order.suborder_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                key: order.suborder_id.clone(),
            })?;
        let status = slot.status;
        *slot = order.clone();
        slot.status = status;
        slot.update_at = Utc::now();
        Ok(())
    }

    async fn find_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<ApplyOrder>> {
        let t = self.tables.lock().await;
        Ok(t.orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect())
    }

    async fn transition_order_status(
        &self,
        suborder_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        match t.orders.get_mut(suborder_id) {
            Some(o) if from.contains(&o.status) => {
                o.status = to;
                o.update_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "order",
                key: suborder_id.to_string(),
            }),
        }
    }

    async fn upsert_step(&self, step: &ApplyStep) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let mut step = step.clone();
        step.update_at = Utc::now();
        t.steps
            .insert((step.suborder_id.clone(), step.step), step);
        Ok(())
    }

    async fn find_steps(&self, suborder_id: &str) -> StoreResult<Vec<ApplyStep>> {
        let t = self.tables.lock().await;
        // BTreeMap ordering on (suborder, StepName) already follows the step ordinal.
        Ok(t.steps
            .iter()
            .filter(|((s, _), _)| s == suborder_id)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn insert_record(&self, record: &GenerateRecord) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.records.contains_key(&record.generate_id) {
            return Err(StoreError::Duplicate {
                entity: "generate record",
                key: record.generate_id.to_string(),
            });
        }
        t.records.insert(record.generate_id, record.clone());
        Ok(())
    }

    async fn get_record(&self, generate_id: u64) -> StoreResult<Option<GenerateRecord>> {
        Ok(self.tables.lock().await.records.get(&generate_id).cloned())
    }

    async fn update_record(&self, record: &GenerateRecord) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let slot = t
            .records
            .get_mut(&record.generate_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "generate record",
                key: record.generate_id.to_string(),
            })?;
        *slot = record.clone();
        slot.update_at = Utc::now();
        Ok(())
    }

    async fn find_records(&self, filter: &RecordFilter) -> StoreResult<Vec<GenerateRecord>> {
        let t = self.tables.lock().await;
        Ok(t.records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn insert_devices(&self, devices: &[DeviceInfo]) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        check_device_keys(t.devices.values(), devices)?;
        for d in devices {
            t.devices.insert(d.id, d.clone());
        }
        Ok(())
    }

    async fn update_device(&self, device: &DeviceInfo) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let slot = t
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "device",
                key: device.id.to_string(),
            })?;
        *slot = device.clone();
        slot.update_at = Utc::now();
        Ok(())
    }

    async fn find_devices(&self, filter: &DeviceFilter) -> StoreResult<Vec<DeviceInfo>> {
        let t = self.tables.lock().await;
        let mut out: Vec<DeviceInfo> = t
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.generate_id, &a.ip).cmp(&(b.generate_id, &b.ip)));
        Ok(out)
    }

    async fn commit_generated(
        &self,
        record: &GenerateRecord,
        devices: &[DeviceInfo],
    ) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if !t.records.contains_key(&record.generate_id) {
            return Err(StoreError::NotFound {
                entity: "generate record",
                key: record.generate_id.to_string(),
            });
        }
        check_device_keys(t.devices.values(), devices)?;
        for d in devices {
            t.devices.insert(d.id, d.clone());
        }
        let mut record = record.clone();
        record.update_at = Utc::now();
        t.records.insert(record.generate_id, record);
        Ok(())
    }

    async fn get_stage_record(
        &self,
        kind: StageKind,
        suborder_id: &str,
        ip: &str,
    ) -> StoreResult<Option<StageRecord>> {
        let t = self.tables.lock().await;
        Ok(t.stage_records
            .get(&(kind, suborder_id.to_string(), ip.to_string()))
            .cloned())
    }

    async fn upsert_stage_record(&self, record: &StageRecord) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let mut record = record.clone();
        record.update_at = Utc::now();
        t.stage_records.insert(
            (record.kind, record.suborder_id.clone(), record.ip.clone()),
            record,
        );
        Ok(())
    }

    async fn find_stage_records(
        &self,
        kind: StageKind,
        suborder_id: &str,
    ) -> StoreResult<Vec<StageRecord>> {
        let t = self.tables.lock().await;
        Ok(t.stage_records
            .values()
            .filter(|r| r.kind == kind && r.suborder_id == suborder_id)
            .cloned()
            .collect())
    }

    async fn count_orders_by_status(&self) -> StoreResult<Vec<(OrderStatus, u64)>> {
        let t = self.tables.lock().await;
        let mut counts: Vec<(OrderStatus, u64)> = Vec::new();
        for o in t.orders.values() {
            match counts.iter_mut().find(|(s, _)| *s == o.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((o.status, 1)),
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supply_common::*;

    fn order() -> ApplyOrder {
        let ticket = ApplyTicket::new(
            7,
            100,
            "bob",
            vec![SuborderRequest {
                resource_type: ResourceType::QcloudCvm,
                spec: ResourceSpec {
                    region: "gz".into(),
                    zone: "gz-1".into(),
                    device_type: "S5".into(),
                    ..Default::default()
                },
                replicas: 2,
                remark: String::new(),
                enable_disk_check: false,
            }],
        );
        ApplyOrder::from_request(&ticket, 0, &ticket.suborders[0])
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_name() {
        let s = MemoryStore::new();
        assert_eq!(s.next_sequence("generate_id").await.unwrap(), 1);
        assert_eq!(s.next_sequence("generate_id").await.unwrap(), 2);
        assert_eq!(s.next_sequence("order_id").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn status_cas_only_moves_from_expected() {
        let s = MemoryStore::new();
        let o = order();
        s.insert_order(&o).await.unwrap();
        let lock = [OrderStatus::WaitForMatch];
        assert!(s
            .transition_order_status(&o.suborder_id, &lock, OrderStatus::Matching)
            .await
            .unwrap());
        assert!(!s
            .transition_order_status(&o.suborder_id, &lock, OrderStatus::Matching)
            .await
            .unwrap());
        let err = s.insert_order(&o).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn stale_order_write_keeps_the_current_status() {
        let s = MemoryStore::new();
        let mut o = order();
        o.status = OrderStatus::Matching;
        s.insert_order(&o).await.unwrap();
        // an operator terminates the order after our copy was loaded
        assert!(s
            .transition_order_status(&o.suborder_id, &[OrderStatus::Matching], OrderStatus::Terminate)
            .await
            .unwrap());

        o.success_num = 1;
        o.message = "1/2 delivered".into();
        s.update_order(&o).await.unwrap();

        let stored = s.get_order(&o.suborder_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Terminate);
        assert_eq!(stored.success_num, 1);
        assert_eq!(stored.message, "1/2 delivered");
    }

    #[tokio::test]
    async fn commit_rejects_duplicate_devices_atomically() {
        let s = MemoryStore::new();
        let o = order();
        let mut rec = GenerateRecord::new(1, &o, 2);
        s.insert_record(&rec).await.unwrap();

        let a = DeviceInfo::new(&o, 1, "10.0.0.1", "TC1");
        let b = DeviceInfo::new(&o, 1, "10.0.0.1", "TC2");
        rec.status = GenerateStatus::Success;
        let err = s.commit_generated(&rec, &[a.clone(), b]).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        // nothing was written
        let stored = s.get_record(1).await.unwrap().unwrap();
        assert_eq!(stored.status, GenerateStatus::Init);
        assert_eq!(
            s.count_devices(&DeviceFilter::suborder(&o.suborder_id))
                .await
                .unwrap(),
            0
        );

        s.commit_generated(&rec, &[a]).await.unwrap();
        assert_eq!(
            s.get_record(1).await.unwrap().unwrap().status,
            GenerateStatus::Success
        );
    }

    #[tokio::test]
    async fn steps_come_back_in_order() {
        let s = MemoryStore::new();
        for step in [StepName::Deliver, StepName::Generate, StepName::Init] {
            s.upsert_step(&ApplyStep::new("7-1", step, 2)).await.unwrap();
        }
        let names: Vec<StepName> = s
            .find_steps("7-1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(
            names,
            vec![StepName::Generate, StepName::Init, StepName::Deliver]
        );
    }
}
