use supply_common::{ApplyOrder, GenerateRecord, GenerateStatus, ResourceType};

use super::{generate_step_untouched, Recoverer};
use crate::error::{OrchestratorError, Result};
use crate::fanout::fan_out;
use crate::store::RecordFilter;
use crate::workflow::steps;

impl Recoverer {
    /// Resume an order that went down while generating.
    pub(super) async fn recover_generate(&self, order: &ApplyOrder) -> Result<()> {
        let id = order.suborder_id.as_str();
        let store = self.engine.store.as_ref();
        let records = store.find_records(&RecordFilter::suborder(id)).await?;
        let found = store.find_steps(id).await?;
        if records.is_empty() || generate_step_untouched(&found) {
            self.engine
                .wait_for_match(id, "nothing generated before restart")
                .await?;
            return Ok(());
        }

        let (init, handling): (Vec<GenerateRecord>, Vec<GenerateRecord>) = records
            .into_iter()
            .filter(|r| r.status.is_in_flight())
            .partition(|r| r.status == GenerateStatus::Init);

        let gen = self.engine.generator.as_ref();
        let pm = order.resource_type == ResourceType::IdcPm;
        let resumed = fan_out(
            self.workers,
            handling
                .into_iter()
                .map(|r| (format!("record {}", r.generate_id), r)),
            move |mut rec| async move {
                if rec.is_manual_matched {
                    gen.resume_manual(order, &mut rec).await
                } else if pm {
                    gen.resume_pm(order, &mut rec).await
                } else {
                    gen.resume_remote(order, &mut rec).await
                }
            },
        )
        .await;
        resumed.log_failures("recovery");

        let mut suspended = 0;
        for mut rec in init {
            if pm || rec.is_manual_matched {
                // nothing left the building yet, a later match picks new hosts
                let replay = OrchestratorError::UnknownOutcome(format!(
                    "generate record {} replayed after restart",
                    rec.generate_id
                ));
                gen.mark_failed(&mut rec, &replay).await;
            } else {
                tracing::warn!(
                    suborder_id = id,
                    generate_id = rec.generate_id,
                    "⚠️ [recovery] batch outcome unknown, suspending"
                );
                gen.mark_suspend(&mut rec, "create call outcome unknown after restart")
                    .await?;
                suspended += 1;
            }
        }

        steps::update_generate_step(store, id).await?;
        self.sweep(order).await?;
        if suspended > 0 {
            let reason = format!(
                "{} generate batch(es) suspended after restart, manual check needed",
                suspended
            );
            self.engine.terminate_order(id, false, &reason).await?;
            return Ok(());
        }
        self.finish(order).await
    }
}
