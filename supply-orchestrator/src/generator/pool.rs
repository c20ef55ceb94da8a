use supply_common::{ApplyOrder, GenerateRecord, RecallLine};
use supply_providers::inventory::RecallRequest;

use super::{Generator, RemoteKind};
use crate::error::{OrchestratorError, Result};
use crate::fanout::{fan_out, Collector};
use crate::retry::retry_transient;

/// Recall lines to launch for `remaining` devices. An order without explicit lines recalls
/// its own device type and zone.
pub fn plan_recall(order: &ApplyOrder, remaining: u32) -> Vec<RecallLine> {
    let lines = if order.spec.recall_lines.is_empty() {
        vec![RecallLine {
            device_type: order.spec.device_type.clone(),
            zone: order.spec.zone.clone(),
            replicas: remaining,
        }]
    } else {
        order.spec.recall_lines.clone()
    };
    let mut left = remaining;
    let mut out = Vec::new();
    for mut line in lines {
        if left == 0 {
            break;
        }
        line.replicas = line.replicas.min(left);
        if line.replicas > 0 {
            left -= line.replicas;
            out.push(line);
        }
    }
    out
}

impl Generator {
    pub(super) async fn generate_pool(&self, order: &ApplyOrder) -> Result<Collector<u64>> {
        let existing = self.existing_devices(&order.suborder_id).await?;
        let remaining = order.total.saturating_sub(existing.len() as u32);
        if remaining == 0 {
            return Ok(Collector::default());
        }
        let items = plan_recall(order, remaining)
            .into_iter()
            .map(|l| (format!("recall {}/{}", l.device_type, l.zone), l));
        Ok(fan_out(self.cfg.concurrency, items, |l| self.launch_recall(order, l)).await)
    }

    async fn launch_recall(&self, order: &ApplyOrder, line: RecallLine) -> Result<u64> {
        if !self.accepts_new_batches(&order.suborder_id).await? {
            return Err(OrchestratorError::OrderInactive(order.suborder_id.clone()));
        }
        let req = RecallRequest {
            region: order.spec.region.clone(),
            zone: line.zone.clone(),
            device_type: line.device_type.clone(),
            count: line.replicas,
            remark: format!("supply {}", order.suborder_id),
        };
        let mut rec = self
            .create_record(order, line.replicas, &line.zone, "", &req)
            .await?;
        let res = self.run_recall(order, &mut rec, &req).await;
        self.settle(&mut rec, res).await
    }

    async fn run_recall(
        &self,
        order: &ApplyOrder,
        rec: &mut GenerateRecord,
        req: &RecallRequest,
    ) -> Result<usize> {
        let budgets = self.cfg.budgets;
        let pool = &self.clients.pool;
        let remote_id = retry_transient(
            "recall create",
            budgets.create_attempts,
            budgets.create_backoff,
            move || async move {
                pool.create_recall_order(req)
                    .await
                    .map_err(OrchestratorError::from)
            },
        )
        .await?;
        self.mark_handling(rec, &remote_id, "").await?;
        let instances = self.wait_remote(RemoteKind::Pool, &remote_id).await?;
        self.add_devices(order, rec, instances, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::{generator, order};
    use crate::store::Store;
    use std::sync::Arc;
    use supply_common::{ResourceSpec, ResourceType};
    use supply_providers::mock::MockCloud;

    fn line(device_type: &str, replicas: u32) -> RecallLine {
        RecallLine {
            device_type: device_type.into(),
            zone: "gz-1".into(),
            replicas,
        }
    }

    #[test]
    fn lines_are_trimmed_to_what_is_missing() {
        let spec = ResourceSpec {
            recall_lines: vec![line("M10", 3), line("Z30", 4), line("IT5", 2)],
            ..Default::default()
        };
        let o = order(ResourceType::Pool, spec, 9);
        let plan = plan_recall(&o, 5);
        assert_eq!(plan.iter().map(|l| l.replicas).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn missing_lines_fall_back_to_the_order_spec() {
        let spec = ResourceSpec {
            device_type: "M10".into(),
            zone: "gz-2".into(),
            ..Default::default()
        };
        let o = order(ResourceType::Pool, spec, 4);
        assert_eq!(
            plan_recall(&o, 4),
            vec![RecallLine {
                device_type: "M10".into(),
                zone: "gz-2".into(),
                replicas: 4
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_line_becomes_one_record() {
        let cloud = Arc::new(MockCloud::new());
        cloud.set_pending_polls(2);
        let (gen, store) = generator(cloud.clone()).await;
        let spec = ResourceSpec {
            region: "gz".into(),
            recall_lines: vec![line("M10", 2), line("Z30", 1)],
            ..Default::default()
        };
        let o = order(ResourceType::Pool, spec, 3);
        store.insert_order(&o).await.unwrap();

        let out = gen.generate(&o).await.unwrap();
        assert_eq!(out.new_ids.len(), 2);
        assert_eq!(gen.existing_devices(&o.suborder_id).await.unwrap().len(), 3);
        assert_eq!(cloud.counters().recall_create, 2);
    }
}
