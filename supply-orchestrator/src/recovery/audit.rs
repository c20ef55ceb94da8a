use std::collections::HashMap;

use supply_common::bus::ApproveTicket;
use supply_common::ApplyTicket;
use supply_providers::inventory::ItsmStatus;
use supply_providers::ITSM_BATCH_LIMIT;

use super::{RecoveryReport, Recoverer};

impl Recoverer {
    /// Replay approval callbacks for tickets whose ITSM ticket finished while we were down.
    pub(super) async fn recover_audit(&self, tickets: &[ApplyTicket], report: &mut RecoveryReport) {
        let by_itsm: HashMap<&str, u64> = tickets
            .iter()
            .filter_map(|t| t.itsm_ticket_id.as_deref().map(|id| (id, t.order_id)))
            .collect();
        if by_itsm.len() < tickets.len() {
            tracing::debug!(
                "[recovery] {} audit ticket(s) without approval ticket, skipped",
                tickets.len() - by_itsm.len()
            );
        }
        let mut ids: Vec<String> = by_itsm.keys().map(|k| k.to_string()).collect();
        ids.sort();

        for chunk in ids.chunks(ITSM_BATCH_LIMIT) {
            let results = match self.engine.clients.itsm.get_ticket_results(chunk).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("❌ [recovery] ITSM query for {} ticket(s) failed: {}", chunk.len(), e);
                    report.failed += chunk.len();
                    continue;
                }
            };
            for r in results.into_iter().filter(|r| r.status.is_finished()) {
                let Some(&order_id) = by_itsm.get(r.ticket_id.as_str()) else {
                    continue;
                };
                let req = ApproveTicket {
                    order_id,
                    approved: r.status == ItsmStatus::Finished && r.approved,
                    operator: r.operator,
                    message: r.message,
                };
                match self.engine.approve_ticket(&req).await {
                    Ok(_) => report.audit_recovered += 1,
                    Err(e) if e.is_duplicate() => {
                        tracing::info!("[recovery] ticket {} already approved, skipped", order_id);
                        report.audit_skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!("❌ [recovery] ticket {}: {}", order_id, e);
                        report.failed += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::recovery::tests::recoverer;
    use crate::store::Store;
    use crate::workflow::tests::cvm_request;
    use std::sync::Arc;
    use supply_common::{ApplyOrder, OrderStatus, TicketStage};
    use supply_providers::inventory::{ItsmStatus, TicketResult};
    use supply_providers::mock::MockCloud;

    fn result(id: u64, status: ItsmStatus, approved: bool) -> TicketResult {
        TicketResult {
            ticket_id: format!("ITSM-{}", id),
            status,
            approved,
            url: String::new(),
            operator: "lead".into(),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn finished_approvals_are_replayed_in_batches() {
        let cloud = Arc::new(MockCloud::new());
        let (rec, engine, store) = recoverer(cloud.clone());
        for _ in 0..150 {
            let t = engine
                .create_ticket(900, "erin", vec![cvm_request("gz-1", 1)])
                .await
                .unwrap();
            engine
                .submit_ticket(t.order_id, Some(format!("ITSM-{}", t.order_id)))
                .await
                .unwrap();
            let status = match t.order_id {
                1 => ItsmStatus::Running,
                2 => ItsmStatus::Revoked,
                _ => ItsmStatus::Finished,
            };
            cloud.set_ticket_result(result(t.order_id, status, true));
        }

        let report = rec.run().await.unwrap();
        assert_eq!(report.tickets_scanned, 150);
        assert_eq!(report.audit_recovered, 149);
        assert_eq!(report.failed, 0);
        let counters = cloud.counters();
        assert_eq!(counters.itsm_queries, 2);
        assert!(counters.itsm_max_batch <= 100);

        assert_eq!(store.get_ticket(1).await.unwrap().unwrap().stage, TicketStage::Audit);
        assert_eq!(store.get_ticket(2).await.unwrap().unwrap().stage, TicketStage::Terminate);
        assert_eq!(store.get_ticket(3).await.unwrap().unwrap().stage, TicketStage::Running);
        let order = store.get_order("3-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::WaitForMatch);
    }

    #[tokio::test]
    async fn interrupted_approval_is_completed_on_replay() {
        let cloud = Arc::new(MockCloud::new());
        let (rec, engine, store) = recoverer(cloud.clone());
        let t = engine
            .create_ticket(900, "erin", vec![cvm_request("gz-1", 1), cvm_request("gz-1", 2)])
            .await
            .unwrap();
        engine
            .submit_ticket(t.order_id, Some("ITSM-1".into()))
            .await
            .unwrap();
        // crash after the first suborder row, before its steps and the rest
        store
            .insert_order(&ApplyOrder::from_request(&t, 0, &t.suborders[0]))
            .await
            .unwrap();
        cloud.set_ticket_result(result(1, ItsmStatus::Finished, true));

        let report = rec.run().await.unwrap();
        assert_eq!(report.audit_recovered, 1);
        assert_eq!(report.audit_skipped, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(store.get_ticket(1).await.unwrap().unwrap().stage, TicketStage::Running);
        for id in ["1-1", "1-2"] {
            let order = store.get_order(id).await.unwrap().unwrap();
            assert_eq!(order.status, OrderStatus::WaitForMatch);
            assert_eq!(store.find_steps(id).await.unwrap().len(), 3);
        }

        let again = rec.run().await.unwrap();
        assert_eq!(again.audit_recovered, 0);
        assert_eq!(again.orders_recovered, 0);
        assert_eq!(again.failed, 0);
        assert_eq!(store.find_steps("1-1").await.unwrap().len(), 3);
    }
}
