//! Guarded order status transitions.
//!
//! Every helper is a compare-and-set: it returns `false` without touching the row when the
//! order is not in one of the expected source statuses, so concurrent callers and replays
//! after a crash are harmless.

use supply_common::OrderStatus;

use crate::store::{Store, StoreResult};

async fn transition(
    store: &dyn Store,
    suborder_id: &str,
    from: &[OrderStatus],
    to: OrderStatus,
    reason: &str,
) -> StoreResult<bool> {
    let moved = store.transition_order_status(suborder_id, from, to).await?;
    if moved {
        tracing::info!(
            suborder_id,
            "🔄 [state_machine] {} -> {} ({})",
            join(from),
            to.as_str(),
            reason
        );
    } else {
        tracing::debug!(
            suborder_id,
            "[state_machine] skip -> {}: not in {}",
            to.as_str(),
            join(from)
        );
    }
    Ok(moved)
}

fn join(statuses: &[OrderStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

/// WAIT -> MATCHING. Only the caller that wins this CAS may run the generator.
pub async fn lock_for_matching(store: &dyn Store, suborder_id: &str) -> StoreResult<bool> {
    transition(
        store,
        suborder_id,
        &[OrderStatus::WaitForMatch],
        OrderStatus::Matching,
        "dispatch",
    )
    .await
}

/// MATCHING -> WAIT, handing the order back to the dispatcher.
pub async fn release_to_wait(
    store: &dyn Store,
    suborder_id: &str,
    reason: &str,
) -> StoreResult<bool> {
    transition(
        store,
        suborder_id,
        &[OrderStatus::Matching],
        OrderStatus::WaitForMatch,
        reason,
    )
    .await
}

/// MATCHED_SOME | PAUSED | WAIT -> WAIT.
pub async fn restart(store: &dyn Store, suborder_id: &str) -> StoreResult<bool> {
    transition(
        store,
        suborder_id,
        &[
            OrderStatus::MatchedSome,
            OrderStatus::Paused,
            OrderStatus::WaitForMatch,
        ],
        OrderStatus::WaitForMatch,
        "restart",
    )
    .await
}

pub async fn pause(store: &dyn Store, suborder_id: &str) -> StoreResult<bool> {
    transition(
        store,
        suborder_id,
        &[
            OrderStatus::WaitForMatch,
            OrderStatus::MatchedSome,
            OrderStatus::Matching,
        ],
        OrderStatus::Paused,
        "pause",
    )
    .await
}

/// Any non-terminal status -> TERMINATE or GRACEFUL_TERMINATE.
pub async fn terminate(
    store: &dyn Store,
    suborder_id: &str,
    graceful: bool,
    reason: &str,
) -> StoreResult<bool> {
    let to = if graceful {
        OrderStatus::GracefulTerminate
    } else {
        OrderStatus::Terminate
    };
    transition(
        store,
        suborder_id,
        &[
            OrderStatus::WaitForMatch,
            OrderStatus::Matching,
            OrderStatus::MatchedSome,
            OrderStatus::Paused,
        ],
        to,
        reason,
    )
    .await
}

/// Manual matching runs outside the generator but takes the same lock.
pub async fn lock_for_manual(store: &dyn Store, suborder_id: &str) -> StoreResult<bool> {
    transition(
        store,
        suborder_id,
        &[
            OrderStatus::WaitForMatch,
            OrderStatus::MatchedSome,
            OrderStatus::Paused,
        ],
        OrderStatus::Matching,
        "manual match",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use supply_common::*;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let ticket = ApplyTicket::new(
            7,
            100,
            "bob",
            vec![SuborderRequest {
                resource_type: ResourceType::QcloudCvm,
                spec: ResourceSpec::default(),
                replicas: 1,
                remark: String::new(),
                enable_disk_check: false,
            }],
        );
        let order = ApplyOrder::from_request(&ticket, 0, &ticket.suborders[0]);
        store.insert_order(&order).await.unwrap();
        store
    }

    #[tokio::test]
    async fn only_one_caller_wins_the_lock() {
        let store = seeded().await;
        assert!(lock_for_matching(&store, "7-1").await.unwrap());
        assert!(!lock_for_matching(&store, "7-1").await.unwrap());
        assert!(release_to_wait(&store, "7-1", "test").await.unwrap());
        assert!(lock_for_matching(&store, "7-1").await.unwrap());
    }

    #[tokio::test]
    async fn terminated_orders_stay_terminated() {
        let store = seeded().await;
        assert!(terminate(&store, "7-1", false, "operator").await.unwrap());
        assert!(!restart(&store, "7-1").await.unwrap());
        assert!(!pause(&store, "7-1").await.unwrap());
        assert!(!terminate(&store, "7-1", true, "again").await.unwrap());
        let order = store.get_order("7-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Terminate);
    }
}
