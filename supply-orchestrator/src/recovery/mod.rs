//! Startup recovery of tickets and orders interrupted by a restart.
//!
//! Discovery only reads; every repair goes through the same engine and generator entry
//! points as live traffic. A batch whose remote outcome cannot be known is suspended and its
//! order terminated, never re-issued.

use chrono::{Duration, Utc};
use supply_common::{ApplyOrder, ApplyTicket, OrderStatus, StepName, StepStatus, TicketStage};

use crate::error::Result;
use crate::fanout::fan_out;
use crate::store::{OrderFilter, RecordFilter, TicketFilter};
use crate::workflow::{steps, Engine};

mod audit;
mod deliver;
mod generate;
mod init;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub tickets_scanned: usize,
    pub audit_recovered: usize,
    /// Approvals already applied before the restart.
    pub audit_skipped: usize,
    pub orders_recovered: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Generate,
    Init,
    Deliver,
    Settled,
}

pub struct Recoverer {
    engine: Engine,
    expire_days: i64,
    workers: usize,
}

impl Recoverer {
    pub fn new(engine: Engine, expire_days: i64) -> Self {
        let workers = engine.cfg.concurrency;
        Self {
            engine,
            expire_days,
            workers,
        }
    }

    /// One full pass. Per-ticket and per-order failures are counted, never fatal.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let filter = TicketFilter {
            stages: vec![TicketStage::Audit, TicketStage::Running],
            created_after: Some(now - Duration::days(self.expire_days)),
            created_before: Some(now),
        };
        let tickets = self.engine.store.find_tickets(&filter).await?;
        let mut report = RecoveryReport {
            tickets_scanned: tickets.len(),
            ..RecoveryReport::default()
        };
        tracing::info!("🔄 [recovery] {} ticket(s) to inspect", tickets.len());

        let (audit, running): (Vec<ApplyTicket>, Vec<ApplyTicket>) = tickets
            .into_iter()
            .partition(|t| t.stage == TicketStage::Audit);
        self.recover_audit(&audit, &mut report).await;

        let mut orders: Vec<ApplyOrder> = Vec::new();
        for t in &running {
            let filter = OrderFilter {
                order_id: Some(t.order_id),
                statuses: vec![OrderStatus::Matching],
                ..OrderFilter::default()
            };
            orders.extend(self.engine.store.find_orders(&filter).await?);
        }
        let this = self;
        let items = orders
            .into_iter()
            .map(|o| (o.suborder_id.clone(), o));
        let done = fan_out(self.workers, items, move |o| async move {
            this.recover_order(&o).await
        })
        .await;
        done.log_failures("recovery");
        report.orders_recovered = done.succeeded.len();
        report.failed += done.failed.len();

        tracing::info!(
            "✅ [recovery] done: {} audit approved, {} skipped, {} order(s) resumed, {} failed",
            report.audit_recovered,
            report.audit_skipped,
            report.orders_recovered,
            report.failed
        );
        Ok(report)
    }

    async fn phase(&self, order: &ApplyOrder) -> Result<Phase> {
        let found = self.engine.store.find_steps(&order.suborder_id).await?;
        let pending = |name: StepName| {
            found
                .iter()
                .find(|s| s.step == name)
                .map_or(true, |s| !s.status.is_terminal())
        };
        Ok(if pending(StepName::Generate) {
            Phase::Generate
        } else if pending(StepName::Init) {
            Phase::Init
        } else if pending(StepName::Deliver) {
            Phase::Deliver
        } else {
            Phase::Settled
        })
    }

    async fn recover_order(&self, order: &ApplyOrder) -> Result<()> {
        let phase = self.phase(order).await?;
        tracing::info!(
            suborder_id = %order.suborder_id,
            "🔁 [recovery] resuming at {:?}",
            phase
        );
        match phase {
            Phase::Generate => self.recover_generate(order).await,
            Phase::Init => self.recover_init(order).await,
            Phase::Deliver => self.recover_deliver(order).await,
            Phase::Settled => {
                steps::final_apply_step(self.engine.store.as_ref(), &order.suborder_id).await?;
                Ok(())
            }
        }
    }

    /// Push every successful record not yet matched through the device stages.
    async fn sweep(&self, order: &ApplyOrder) -> Result<()> {
        let filter = RecordFilter {
            is_matched: Some(false),
            ..RecordFilter::suborder(&order.suborder_id)
        };
        let ids: Vec<u64> = self
            .engine
            .store
            .find_records(&filter)
            .await?
            .into_iter()
            .filter(|r| r.needs_matching())
            .map(|r| r.generate_id)
            .collect();
        for id in ids {
            if let Err(e) = self.engine.process_record(order, id).await {
                tracing::warn!(
                    suborder_id = %order.suborder_id,
                    generate_id = id,
                    "⚠️ [recovery] record not fully processed: {}",
                    e
                );
            }
        }
        Ok(())
    }

    /// Settle the order once its devices are all there, otherwise hand it back to the
    /// dispatcher.
    async fn finish(&self, order: &ApplyOrder) -> Result<()> {
        let id = order.suborder_id.as_str();
        let latest = self.engine.load_order(id).await?;
        let bound = self
            .engine
            .store
            .count_devices(&crate::store::DeviceFilter::suborder(id))
            .await? as u32;
        if bound >= latest.total {
            steps::final_apply_step(self.engine.store.as_ref(), id).await?;
        } else {
            self.engine
                .wait_for_match(id, "recovered with devices missing")
                .await?;
        }
        Ok(())
    }
}

fn generate_step_untouched(steps: &[supply_common::ApplyStep]) -> bool {
    steps
        .iter()
        .find(|s| s.step == StepName::Generate)
        .map_or(true, |s| s.status == StepStatus::Init)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use crate::workflow::tests::{approved, cvm_request, engine};
    use std::sync::Arc;
    use supply_providers::mock::MockCloud;

    pub fn recoverer(cloud: Arc<MockCloud>) -> (Recoverer, Engine, Arc<MemoryStore>) {
        let (engine, store) = engine(cloud, false);
        (Recoverer::new(engine.clone(), 3), engine, store)
    }

    #[tokio::test]
    async fn stale_tickets_are_left_alone() {
        let cloud = Arc::new(MockCloud::new());
        let (rec, engine, store) = recoverer(cloud);
        approved(&engine, vec![cvm_request("gz-1", 1)]).await;
        let mut ticket = store.get_ticket(1).await.unwrap().unwrap();
        ticket.create_at = Utc::now() - Duration::days(4);
        store.update_ticket(&ticket).await.unwrap();

        let report = rec.run().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn orders_without_records_go_back_to_waiting() {
        let cloud = Arc::new(MockCloud::new());
        let (rec, engine, store) = recoverer(cloud.clone());
        approved(&engine, vec![cvm_request("gz-1", 1)]).await;
        crate::state_machine::lock_for_matching(store.as_ref(), "1-1")
            .await
            .unwrap();

        let report = rec.run().await.unwrap();
        assert_eq!(report.tickets_scanned, 1);
        assert_eq!(report.orders_recovered, 1);
        let order = store.get_order("1-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::WaitForMatch);
        assert_eq!(cloud.counters().cvm_create, 0);
    }
}
