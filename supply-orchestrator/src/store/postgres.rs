//! Postgres backend. Entities are stored as JSONB documents next to the columns used for
//! lookups and uniqueness; schema lives in `sqlx-migrations/`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{Pool, Postgres, Row};

use supply_common::{
    ApplyOrder, ApplyStep, ApplyTicket, DeviceInfo, GenerateRecord, OrderStatus, StageKind,
    StageRecord,
};

use super::*;

pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

fn db_err(e: sqlx::Error, entity: &'static str, key: &str) -> StoreError {
    if let sqlx::Error::Database(ref dbe) = e {
        if dbe.code().as_deref() == Some("23505") {
            return StoreError::Duplicate {
                entity,
                key: key.to_string(),
            };
        }
    }
    StoreError::Database(e.to_string())
}

/// Serde name of a unit enum variant, used for the indexed status columns.
fn tag<T: Serialize>(v: &T) -> StoreResult<String> {
    match serde_json::to_value(v)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn decode<T: DeserializeOwned>(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<T>> {
    rows.into_iter()
        .map(|r| {
            let doc: serde_json::Value = r
                .try_get("doc")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(serde_json::from_value(doc)?)
        })
        .collect()
}

fn decode_one<T: DeserializeOwned>(row: Option<sqlx::postgres::PgRow>) -> StoreResult<Option<T>> {
    Ok(decode(row.into_iter().collect())?.pop())
}

fn not_found(affected: u64, entity: &'static str, key: String) -> StoreResult<()> {
    if affected == 0 {
        Err(StoreError::NotFound { entity, key })
    } else {
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn next_sequence(&self, name: &str) -> StoreResult<u64> {
        let v: i64 = sqlx::query_scalar(
            "INSERT INTO sequences (name, value) VALUES ($1, 1)
             ON CONFLICT (name) DO UPDATE SET value = sequences.value + 1
             RETURNING value",
        )
        .bind(name)
        .fetch_one(&self.db)
        .await
        .map_err(|e| db_err(e, "sequence", name))?;
        Ok(v as u64)
    }

    async fn insert_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()> {
        let key = ticket.order_id.to_string();
        sqlx::query(
            "INSERT INTO apply_tickets (order_id, stage, create_at, doc) VALUES ($1, $2, $3, $4)",
        )
        .bind(ticket.order_id as i64)
        .bind(tag(&ticket.stage)?)
        .bind(ticket.create_at)
        .bind(serde_json::to_value(ticket)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "ticket", &key))?;
        Ok(())
    }

    async fn get_ticket(&self, order_id: u64) -> StoreResult<Option<ApplyTicket>> {
        let row = sqlx::query("SELECT doc FROM apply_tickets WHERE order_id = $1")
            .bind(order_id as i64)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_err(e, "ticket", &order_id.to_string()))?;
        decode_one(row)
    }

    async fn update_ticket(&self, ticket: &ApplyTicket) -> StoreResult<()> {
        let key = ticket.order_id.to_string();
        let mut ticket = ticket.clone();
        ticket.update_at = Utc::now();
        let res = sqlx::query("UPDATE apply_tickets SET stage = $2, doc = $3 WHERE order_id = $1")
            .bind(ticket.order_id as i64)
            .bind(tag(&ticket.stage)?)
            .bind(serde_json::to_value(&ticket)?)
            .execute(&self.db)
            .await
            .map_err(|e| db_err(e, "ticket", &key))?;
        not_found(res.rows_affected(), "ticket", key)
    }

    async fn find_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<ApplyTicket>> {
        let stages = filter
            .stages
            .iter()
            .map(tag)
            .collect::<StoreResult<Vec<String>>>()?;
        let rows = sqlx::query(
            "SELECT doc FROM apply_tickets
             WHERE (cardinality($1::text[]) = 0 OR stage = ANY($1))
               AND ($2::timestamptz IS NULL OR create_at >= $2)
               AND ($3::timestamptz IS NULL OR create_at < $3)
             ORDER BY order_id",
        )
        .bind(&stages)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_all(&self.db)
        .await
        .map_err(|e| db_err(e, "ticket", "*"))?;
        decode(rows)
    }

    async fn insert_order(&self, order: &ApplyOrder) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO apply_orders (suborder_id, order_id, status, stage, doc)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&order.suborder_id)
        .bind(order.order_id as i64)
        .bind(tag(&order.status)?)
        .bind(tag(&order.stage)?)
        .bind(serde_json::to_value(order)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "order", &order.suborder_id))?;
        Ok(())
    }

    async fn get_order(&self, suborder_id: &str) -> StoreResult<Option<ApplyOrder>> {
        let row = sqlx::query("SELECT doc FROM apply_orders WHERE suborder_id = $1")
            .bind(suborder_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_err(e, "order", suborder_id))?;
        decode_one(row)
    }

    async fn update_order(&self, order: &ApplyOrder) -> StoreResult<()> {
        let mut order = order.clone();
        order.update_at = Utc::now();
        let res = sqlx::query(
            "UPDATE apply_orders
             SET stage = $2, doc = jsonb_set($3::jsonb, '{status}', doc->'status')
             WHERE suborder_id = $1",
        )
        .bind(&order.suborder_id)
        .bind(tag(&order.stage)?)
        .bind(serde_json::to_value(&order)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "order", &order.suborder_id))?;
        not_found(res.rows_affected(), "order", order.suborder_id.clone())
    }

    async fn find_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<ApplyOrder>> {
        let statuses = filter
            .statuses
            .iter()
            .map(tag)
            .collect::<StoreResult<Vec<String>>>()?;
        let stages = filter
            .stages
            .iter()
            .map(tag)
            .collect::<StoreResult<Vec<String>>>()?;
        let rows = sqlx::query(
            "SELECT doc FROM apply_orders
             WHERE ($1::bigint IS NULL OR order_id = $1)
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))
               AND (cardinality($3::text[]) = 0 OR stage = ANY($3))
             ORDER BY suborder_id",
        )
        .bind(filter.order_id.map(|id| id as i64))
        .bind(&statuses)
        .bind(&stages)
        .fetch_all(&self.db)
        .await
        .map_err(|e| db_err(e, "order", "*"))?;
        decode(rows)
    }

    async fn transition_order_status(
        &self,
        suborder_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool> {
        let from = from.iter().map(tag).collect::<StoreResult<Vec<String>>>()?;
        let to = tag(&to)?;
        let res = sqlx::query(
            "UPDATE apply_orders
             SET status = $3,
                 doc = jsonb_set(jsonb_set(doc, '{status}', to_jsonb($3::text)),
                                 '{update_at}', to_jsonb($4::text))
             WHERE suborder_id = $1 AND status = ANY($2)",
        )
        .bind(suborder_id)
        .bind(&from)
        .bind(&to)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "order", suborder_id))?;
        if res.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM apply_orders WHERE suborder_id = $1)")
                .bind(suborder_id)
                .fetch_one(&self.db)
                .await
                .map_err(|e| db_err(e, "order", suborder_id))?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound {
                entity: "order",
                key: suborder_id.to_string(),
            })
        }
    }

    async fn upsert_step(&self, step: &ApplyStep) -> StoreResult<()> {
        let mut step = step.clone();
        step.update_at = Utc::now();
        sqlx::query(
            "INSERT INTO apply_steps (suborder_id, ordinal, doc) VALUES ($1, $2, $3)
             ON CONFLICT (suborder_id, ordinal) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(&step.suborder_id)
        .bind(step.step.ordinal() as i16)
        .bind(serde_json::to_value(&step)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "step", &step.suborder_id))?;
        Ok(())
    }

    async fn find_steps(&self, suborder_id: &str) -> StoreResult<Vec<ApplyStep>> {
        let rows =
            sqlx::query("SELECT doc FROM apply_steps WHERE suborder_id = $1 ORDER BY ordinal")
                .bind(suborder_id)
                .fetch_all(&self.db)
                .await
                .map_err(|e| db_err(e, "step", suborder_id))?;
        decode(rows)
    }

    async fn insert_record(&self, record: &GenerateRecord) -> StoreResult<()> {
        let key = record.generate_id.to_string();
        sqlx::query(
            "INSERT INTO generate_records (generate_id, suborder_id, status, is_matched, doc)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.generate_id as i64)
        .bind(&record.suborder_id)
        .bind(record.status.code())
        .bind(record.is_matched)
        .bind(serde_json::to_value(record)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "generate record", &key))?;
        Ok(())
    }

    async fn get_record(&self, generate_id: u64) -> StoreResult<Option<GenerateRecord>> {
        let row = sqlx::query("SELECT doc FROM generate_records WHERE generate_id = $1")
            .bind(generate_id as i64)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_err(e, "generate record", &generate_id.to_string()))?;
        decode_one(row)
    }

    async fn update_record(&self, record: &GenerateRecord) -> StoreResult<()> {
        let key = record.generate_id.to_string();
        let mut record = record.clone();
        record.update_at = Utc::now();
        let res = sqlx::query(
            "UPDATE generate_records SET status = $2, is_matched = $3, doc = $4
             WHERE generate_id = $1",
        )
        .bind(record.generate_id as i64)
        .bind(record.status.code())
        .bind(record.is_matched)
        .bind(serde_json::to_value(&record)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "generate record", &key))?;
        not_found(res.rows_affected(), "generate record", key)
    }

    async fn find_records(&self, filter: &RecordFilter) -> StoreResult<Vec<GenerateRecord>> {
        let codes: Vec<i32> = filter.statuses.iter().map(|s| s.code()).collect();
        let rows = sqlx::query(
            "SELECT doc FROM generate_records
             WHERE suborder_id = $1
               AND (cardinality($2::int[]) = 0 OR status = ANY($2))
               AND ($3::bool IS NULL OR is_matched = $3)
             ORDER BY generate_id",
        )
        .bind(&filter.suborder_id)
        .bind(&codes)
        .bind(filter.is_matched)
        .fetch_all(&self.db)
        .await
        .map_err(|e| db_err(e, "generate record", &filter.suborder_id))?;
        decode(rows)
    }

    async fn insert_devices(&self, devices: &[DeviceInfo]) -> StoreResult<()> {
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        for d in devices {
            insert_device(&mut tx, d).await?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn update_device(&self, device: &DeviceInfo) -> StoreResult<()> {
        let mut device = device.clone();
        device.update_at = Utc::now();
        let res = sqlx::query("UPDATE device_infos SET stage = $2, doc = $3 WHERE id = $1")
            .bind(device.id)
            .bind(tag(&device.stage)?)
            .bind(serde_json::to_value(&device)?)
            .execute(&self.db)
            .await
            .map_err(|e| db_err(e, "device", &device.ip))?;
        not_found(res.rows_affected(), "device", device.id.to_string())
    }

    async fn find_devices(&self, filter: &DeviceFilter) -> StoreResult<Vec<DeviceInfo>> {
        let ids: Vec<i64> = filter.generate_ids.iter().map(|id| *id as i64).collect();
        let stages = filter
            .stages
            .iter()
            .map(tag)
            .collect::<StoreResult<Vec<String>>>()?;
        let rows = sqlx::query(
            "SELECT doc FROM device_infos
             WHERE suborder_id = $1
               AND (cardinality($2::bigint[]) = 0 OR generate_id = ANY($2))
               AND (cardinality($3::text[]) = 0 OR stage = ANY($3))
             ORDER BY generate_id, ip",
        )
        .bind(&filter.suborder_id)
        .bind(&ids)
        .bind(&stages)
        .fetch_all(&self.db)
        .await
        .map_err(|e| db_err(e, "device", &filter.suborder_id))?;
        decode(rows)
    }

    async fn commit_generated(
        &self,
        record: &GenerateRecord,
        devices: &[DeviceInfo],
    ) -> StoreResult<()> {
        let key = record.generate_id.to_string();
        let mut record = record.clone();
        record.update_at = Utc::now();
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        for d in devices {
            insert_device(&mut tx, d).await?;
        }
        let res = sqlx::query(
            "UPDATE generate_records SET status = $2, is_matched = $3, doc = $4
             WHERE generate_id = $1",
        )
        .bind(record.generate_id as i64)
        .bind(record.status.code())
        .bind(record.is_matched)
        .bind(serde_json::to_value(&record)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err(e, "generate record", &key))?;
        // dropping the transaction rolls the device inserts back
        not_found(res.rows_affected(), "generate record", key)?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn get_stage_record(
        &self,
        kind: StageKind,
        suborder_id: &str,
        ip: &str,
    ) -> StoreResult<Option<StageRecord>> {
        let row = sqlx::query(
            "SELECT doc FROM stage_records WHERE kind = $1 AND suborder_id = $2 AND ip = $3",
        )
        .bind(kind.as_str())
        .bind(suborder_id)
        .bind(ip)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| db_err(e, "stage record", ip))?;
        decode_one(row)
    }

    async fn upsert_stage_record(&self, record: &StageRecord) -> StoreResult<()> {
        let mut record = record.clone();
        record.update_at = Utc::now();
        sqlx::query(
            "INSERT INTO stage_records (kind, suborder_id, ip, doc) VALUES ($1, $2, $3, $4)
             ON CONFLICT (kind, suborder_id, ip) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(record.kind.as_str())
        .bind(&record.suborder_id)
        .bind(&record.ip)
        .bind(serde_json::to_value(&record)?)
        .execute(&self.db)
        .await
        .map_err(|e| db_err(e, "stage record", &record.ip))?;
        Ok(())
    }

    async fn find_stage_records(
        &self,
        kind: StageKind,
        suborder_id: &str,
    ) -> StoreResult<Vec<StageRecord>> {
        let rows = sqlx::query(
            "SELECT doc FROM stage_records WHERE kind = $1 AND suborder_id = $2 ORDER BY ip",
        )
        .bind(kind.as_str())
        .bind(suborder_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| db_err(e, "stage record", suborder_id))?;
        decode(rows)
    }

    async fn count_orders_by_status(&self) -> StoreResult<Vec<(OrderStatus, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM apply_orders GROUP BY status")
                .fetch_all(&self.db)
                .await
                .map_err(|e| db_err(e, "order", "*"))?;
        rows.into_iter()
            .map(|(status, n)| {
                let status: OrderStatus = serde_json::from_value(serde_json::Value::String(status))?;
                Ok((status, n as u64))
            })
            .collect()
    }
}

async fn insert_device(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    d: &DeviceInfo,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO device_infos (id, suborder_id, generate_id, ip, asset_id, stage, doc)
         VALUES ($1, $2, $3, $4, NULLIF($5, ''), $6, $7)",
    )
    .bind(d.id)
    .bind(&d.suborder_id)
    .bind(d.generate_id as i64)
    .bind(&d.ip)
    .bind(&d.asset_id)
    .bind(tag(&d.stage)?)
    .bind(serde_json::to_value(d)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| db_err(e, "device", &format!("{}/{}", d.suborder_id, d.ip)))?;
    Ok(())
}
