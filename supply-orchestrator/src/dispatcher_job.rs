use std::time::Duration;

use supply_common::{ApplyOrder, OrderStatus, TicketStage};

use crate::error::Result;
use crate::fanout::fan_out;
use crate::store::OrderFilter;
use crate::workflow::Engine;

/// job-dispatch: picks up orders waiting for a match.
///
/// Redis commands are not durable, and recovery hands interrupted orders back by moving
/// them to WAIT; this loop is what turns both into matching passes.
pub async fn run(engine: Engine, every: Duration) {
    let mut interval = tokio::time::interval(every);
    tracing::info!("🔁 [job-dispatch] started (every {:?})", every);

    loop {
        interval.tick().await;
        match run_once(&engine).await {
            Ok(count) if count > 0 => {
                tracing::info!("🔁 [job-dispatch] dispatched {} order(s)", count)
            }
            Ok(_) => {}
            Err(e) => tracing::error!("❌ [job-dispatch] {}", e),
        }
    }
}

/// Dispatch every waiting order of a running ticket once. Returns how many passes ran
/// without error.
pub async fn run_once(engine: &Engine) -> Result<usize> {
    let filter = OrderFilter {
        statuses: vec![OrderStatus::WaitForMatch],
        stages: vec![TicketStage::Running],
        ..OrderFilter::default()
    };
    let waiting: Vec<ApplyOrder> = engine.store().find_orders(&filter).await?;
    if waiting.is_empty() {
        return Ok(0);
    }
    let items = waiting.into_iter().map(|o| (o.suborder_id.clone(), o));
    let done = fan_out(engine.cfg.concurrency, items, move |o: ApplyOrder| async move {
        engine.dispatch(&o.suborder_id).await
    })
    .await;
    done.log_failures("job-dispatch");
    Ok(done.succeeded.len())
}
