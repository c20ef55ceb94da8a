//! Ticket -> suborder -> step bookkeeping, and the sweep that drives generated devices
//! through init, disk check and delivery.

use std::sync::Arc;

use chrono::Utc;
use supply_common::bus::{ApproveTicket, ManualMatch, ModifyOrder};
use supply_common::{
    ApplyOrder, ApplyStep, ApplyTicket, DeviceInfo, OrderStatus, StepName, StepStatus,
    SuborderRequest, TicketStage,
};

use crate::clients::Clients;
use crate::config::Settings;
use crate::error::{OrchestratorError, Result};
use crate::fanout::fan_out;
use crate::generator::Generator;
use crate::retry::PollBudgets;
use crate::state_machine;
use crate::store::{DeviceFilter, Store};

pub mod deliver;
pub mod disk_check;
pub mod init;
pub mod steps;
mod task;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub staging_biz_id: i64,
    pub enable_disk_check: bool,
    /// Host operator written at delivery when the order has no user.
    pub operator: String,
    pub budgets: PollBudgets,
    pub concurrency: usize,
}

impl From<&Settings> for EngineConfig {
    fn from(s: &Settings) -> Self {
        Self {
            staging_biz_id: s.staging_biz_id,
            enable_disk_check: s.enable_disk_check,
            operator: s.operator.clone(),
            budgets: s.budgets,
            concurrency: s.concurrency,
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clients: Clients,
    pub(crate) generator: Arc<Generator>,
    pub(crate) cfg: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Clients,
        generator: Arc<Generator>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            clients,
            generator,
            cfg: Arc::new(cfg),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub(crate) async fn load_order(&self, suborder_id: &str) -> Result<ApplyOrder> {
        self.store
            .get_order(suborder_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {}", suborder_id)))
    }

    async fn load_ticket(&self, order_id: u64) -> Result<ApplyTicket> {
        self.store
            .get_ticket(order_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("ticket {}", order_id)))
    }

    pub async fn create_ticket(
        &self,
        bk_biz_id: i64,
        user: &str,
        suborders: Vec<SuborderRequest>,
    ) -> Result<ApplyTicket> {
        let id = self.store.next_sequence("order_id").await?;
        let ticket = ApplyTicket::new(id, bk_biz_id, user, suborders);
        self.store.insert_ticket(&ticket).await?;
        tracing::info!("📝 [workflow] ticket {} created for biz {}", id, bk_biz_id);
        Ok(ticket)
    }

    /// UNCOMMIT -> AUDIT, remembering the approval ticket to poll.
    pub async fn submit_ticket(&self, order_id: u64, itsm_ticket_id: Option<String>) -> Result<()> {
        let mut ticket = self.load_ticket(order_id).await?;
        if ticket.stage != TicketStage::Uncommit {
            return Err(OrchestratorError::InvalidTransition {
                entity: "ticket",
                id: order_id.to_string(),
                from: ticket.stage.as_str().to_string(),
                to: TicketStage::Audit.as_str().to_string(),
            });
        }
        ticket.stage = TicketStage::Audit;
        ticket.itsm_ticket_id = itsm_ticket_id;
        self.store.update_ticket(&ticket).await?;
        tracing::info!("[workflow] ticket {} submitted for approval", order_id);
        Ok(())
    }

    /// Approval callback. Creates the suborders and their steps and returns their ids; the
    /// caller or the dispatcher job starts matching them.
    ///
    /// Orders are inserted before the ticket moves on. A replay after a crash in between
    /// keeps the orders already there and creates the rest.
    pub async fn approve_ticket(&self, req: &ApproveTicket) -> Result<Vec<String>> {
        let mut ticket = self.load_ticket(req.order_id).await?;
        if ticket.stage != TicketStage::Audit {
            return Err(OrchestratorError::InvalidTransition {
                entity: "ticket",
                id: req.order_id.to_string(),
                from: ticket.stage.as_str().to_string(),
                to: if req.approved {
                    TicketStage::Running.as_str().to_string()
                } else {
                    TicketStage::Terminate.as_str().to_string()
                },
            });
        }
        ticket.approved_by = Some(req.operator.clone());
        ticket.approve_message = Some(req.message.clone());
        ticket.approve_at = Some(Utc::now());

        if !req.approved {
            ticket.stage = TicketStage::Terminate;
            self.store.update_ticket(&ticket).await?;
            tracing::info!("[workflow] ticket {} rejected by {}", req.order_id, req.operator);
            return Ok(vec![]);
        }

        let mut ids = Vec::with_capacity(ticket.suborders.len());
        for (i, sub) in ticket.suborders.iter().enumerate() {
            let order = self.ensure_order(&ticket, i, sub).await?;
            ids.push(order.suborder_id);
        }
        ticket.stage = TicketStage::Running;
        self.store.update_ticket(&ticket).await?;
        tracing::info!(
            "✅ [workflow] ticket {} approved, {} suborder(s)",
            req.order_id,
            ids.len()
        );
        Ok(ids)
    }

    /// Suborder `index` of an approved ticket with all of its steps. Rows left behind by an
    /// interrupted approval are kept as they are; only missing ones are created.
    async fn ensure_order(
        &self,
        ticket: &ApplyTicket,
        index: usize,
        sub: &SuborderRequest,
    ) -> Result<ApplyOrder> {
        let mut fresh = ApplyOrder::from_request(ticket, index, sub);
        fresh.enable_disk_check = sub.enable_disk_check || self.cfg.enable_disk_check;
        let order = match self.store.get_order(&fresh.suborder_id).await? {
            Some(existing) => {
                tracing::info!(
                    suborder_id = %existing.suborder_id,
                    "[workflow] order already created, reusing it"
                );
                existing
            }
            None => {
                self.store.insert_order(&fresh).await?;
                fresh
            }
        };

        let have: Vec<StepName> = self
            .store
            .find_steps(&order.suborder_id)
            .await?
            .into_iter()
            .map(|s| s.step)
            .collect();
        for step in order.steps().into_iter().filter(|s| !have.contains(s)) {
            self.store
                .upsert_step(&ApplyStep::new(&order.suborder_id, step, order.total))
                .await?;
        }
        Ok(order)
    }

    /// WAIT | MATCHED_SOME | PAUSED -> WAIT, then match.
    pub async fn start_order(&self, suborder_id: &str) -> Result<()> {
        if !state_machine::restart(self.store.as_ref(), suborder_id).await? {
            let order = self.load_order(suborder_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                entity: "order",
                id: suborder_id.to_string(),
                from: order.status.as_str().to_string(),
                to: OrderStatus::WaitForMatch.as_str().to_string(),
            });
        }
        self.dispatch(suborder_id).await
    }

    /// Run one matching pass. Does nothing when another caller holds the order.
    pub async fn dispatch(&self, suborder_id: &str) -> Result<()> {
        if !state_machine::lock_for_matching(self.store.as_ref(), suborder_id).await? {
            tracing::debug!(suborder_id, "[workflow] not waiting for match, skip dispatch");
            return Ok(());
        }
        let order = self.load_order(suborder_id).await?;
        self.begin_generate(&order).await?;

        let unmatched = match self.generator.generate(&order).await {
            Ok(outcome) => outcome.unmatched_ids,
            Err(e) => {
                tracing::error!(suborder_id, "❌ [workflow] generate failed: {}", e);
                self.set_order_message(suborder_id, &e.to_string()).await?;
                steps::fail_step(self.store.as_ref(), suborder_id, StepName::Generate, &e)
                    .await?;
                self.generator.unmatched_ids(suborder_id).await?
            }
        };
        steps::update_generate_step(self.store.as_ref(), suborder_id).await?;

        for id in unmatched {
            if let Err(e) = self.process_record(&order, id).await {
                tracing::warn!(
                    suborder_id,
                    generate_id = id,
                    "⚠️ [workflow] record not fully processed: {}",
                    e
                );
            }
        }
        steps::final_apply_step(self.store.as_ref(), suborder_id).await?;
        Ok(())
    }

    /// Generate goes Handling, later steps restart from Init.
    async fn begin_generate(&self, order: &ApplyOrder) -> Result<()> {
        let now = Utc::now();
        for mut step in self.store.find_steps(&order.suborder_id).await? {
            if step.step == StepName::Generate {
                step.status = StepStatus::Handling;
                step.start_at.get_or_insert(now);
                step.end_at = None;
                step.message.clear();
            } else if step.status != StepStatus::Init {
                step.status = StepStatus::Init;
                step.end_at = None;
                step.message.clear();
            } else {
                continue;
            }
            step.update_at = now;
            self.store.upsert_step(&step).await?;
        }
        Ok(())
    }

    pub(crate) async fn set_order_message(&self, suborder_id: &str, message: &str) -> Result<()> {
        let mut order = self.load_order(suborder_id).await?;
        order.message = message.to_string();
        order.update_at = Utc::now();
        self.store.update_order(&order).await?;
        Ok(())
    }

    /// Drive the devices of one successful record through every stage.
    ///
    /// Devices fail independently. The record is marked matched only once all of its devices
    /// are delivered, so a later pass picks up the rest.
    pub async fn process_record(&self, order: &ApplyOrder, generate_id: u64) -> Result<()> {
        let filter = DeviceFilter {
            generate_ids: vec![generate_id],
            ..DeviceFilter::suborder(&order.suborder_id)
        };
        let devices = self.store.find_devices(&filter).await?;
        let limit = self.cfg.concurrency;

        let inited = fan_out(limit, labelled(devices), |d| init::run(self, order, d)).await;
        inited.log_failures("job-init");
        steps::update_init_step(self.store.as_ref(), &order.suborder_id).await?;

        let ready = if order.enable_disk_check {
            let checked = fan_out(limit, labelled(inited.succeeded), |d| {
                disk_check::run(self, order, d)
            })
            .await;
            checked.log_failures("job-diskcheck");
            steps::update_disk_check_step(self.store.as_ref(), &order.suborder_id).await?;
            checked.succeeded
        } else {
            inited.succeeded
        };

        let delivered = fan_out(limit, labelled(ready), |d| deliver::run(self, order, d)).await;
        delivered.log_failures("job-deliver");
        steps::update_deliver_step(self.store.as_ref(), &order.suborder_id).await?;

        let all_delivered = self
            .store
            .find_devices(&filter)
            .await?
            .iter()
            .all(|d| d.stage.is_delivered());
        if all_delivered {
            if let Some(mut rec) = self.store.get_record(generate_id).await? {
                rec.is_matched = true;
                rec.update_at = Utc::now();
                self.store.update_record(&rec).await?;
            }
        }
        Ok(())
    }

    /// MATCHING -> WAIT; the dispatcher picks the order up again later.
    pub async fn wait_for_match(&self, suborder_id: &str, reason: &str) -> Result<bool> {
        Ok(state_machine::release_to_wait(self.store.as_ref(), suborder_id, reason).await?)
    }

    pub async fn pause_order(&self, suborder_id: &str) -> Result<()> {
        if !state_machine::pause(self.store.as_ref(), suborder_id).await? {
            let order = self.load_order(suborder_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                entity: "order",
                id: suborder_id.to_string(),
                from: order.status.as_str().to_string(),
                to: OrderStatus::Paused.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Stop the order. A graceful stop lets batches already in flight finish.
    pub async fn terminate_order(&self, suborder_id: &str, graceful: bool, reason: &str) -> Result<()> {
        if !state_machine::terminate(self.store.as_ref(), suborder_id, graceful, reason).await? {
            let order = self.load_order(suborder_id).await?;
            return Err(OrchestratorError::OrderInactive(format!(
                "{} ({})",
                suborder_id,
                order.status.as_str()
            )));
        }
        self.set_order_message(suborder_id, reason).await?;
        steps::final_apply_step(self.store.as_ref(), suborder_id).await?;
        Ok(())
    }

    /// Change replicas or spec of an order that is not being matched.
    pub async fn modify_order(&self, req: &ModifyOrder) -> Result<ApplyOrder> {
        let mut order = self.load_order(&req.suborder_id).await?;
        if order.status.is_terminal() {
            return Err(OrchestratorError::OrderInactive(req.suborder_id.clone()));
        }
        if order.status == OrderStatus::Matching {
            return Err(OrchestratorError::InvalidTransition {
                entity: "order",
                id: req.suborder_id.clone(),
                from: order.status.as_str().to_string(),
                to: "MODIFIED".to_string(),
            });
        }
        if let Some(total) = req.total {
            let bound = self
                .store
                .count_devices(&DeviceFilter::suborder(&req.suborder_id))
                .await? as u32;
            if total < bound {
                return Err(OrchestratorError::InvalidTransition {
                    entity: "order",
                    id: req.suborder_id.clone(),
                    from: format!("{} bound device(s)", bound),
                    to: format!("total {}", total),
                });
            }
            order.total = total;
            for mut step in self.store.find_steps(&req.suborder_id).await? {
                step.total = total;
                self.store.upsert_step(&step).await?;
            }
        }
        if let Some(spec) = &req.spec {
            order.spec = spec.clone();
        }
        order.update_at = Utc::now();
        self.store.update_order(&order).await?;
        tracing::info!(suborder_id = %req.suborder_id, "[workflow] order modified");
        Ok(order)
    }

    /// Bind operator-chosen hosts and deliver them.
    pub async fn manual_match(&self, req: &ManualMatch) -> Result<u64> {
        let suborder_id = req.suborder_id.as_str();
        if !state_machine::lock_for_manual(self.store.as_ref(), suborder_id).await? {
            let order = self.load_order(suborder_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                entity: "order",
                id: suborder_id.to_string(),
                from: order.status.as_str().to_string(),
                to: OrderStatus::Matching.as_str().to_string(),
            });
        }
        let order = self.load_order(suborder_id).await?;
        let operator = if req.operator.is_empty() {
            self.cfg.operator.as_str()
        } else {
            req.operator.as_str()
        };
        let matched = self
            .generator
            .manual_match(&order, &req.asset_ids, operator)
            .await;
        match &matched {
            Ok(id) => {
                if let Err(e) = self.process_record(&order, *id).await {
                    tracing::warn!(suborder_id, "⚠️ [workflow] manual record {}: {}", id, e);
                }
            }
            Err(e) => self.set_order_message(suborder_id, &e.to_string()).await?,
        }
        steps::update_generate_step(self.store.as_ref(), suborder_id).await?;
        steps::final_apply_step(self.store.as_ref(), suborder_id).await?;
        matched
    }
}

fn labelled(devices: Vec<DeviceInfo>) -> impl Iterator<Item = (String, DeviceInfo)> {
    devices.into_iter().map(|d| (d.ip.clone(), d))
}
