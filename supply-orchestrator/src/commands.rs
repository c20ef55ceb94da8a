//! `CMD:*` commands arriving on the Redis command channel.

use futures_util::StreamExt;
use supply_common::bus::{
    ApproveTicket, CommandEnvelope, CommandType, ManualMatch, ModifyOrder, OrderCommand,
    TerminateOrder, TicketCommand, CHANNEL_SUPPLY_COMMANDS,
};

use crate::error::{OrchestratorError, Result};
use crate::workflow::Engine;

fn decode<T: serde::de::DeserializeOwned>(env: &CommandEnvelope) -> Result<T> {
    env.payload_as().map_err(|source| OrchestratorError::BadCommand {
        command: env.command_type.as_str(),
        source,
    })
}

/// Apply one command. Approved tickets have their orders dispatched right away.
pub async fn handle(engine: &Engine, env: &CommandEnvelope) -> Result<()> {
    match env.command_type {
        CommandType::SubmitTicket => {
            let cmd: TicketCommand = decode(env)?;
            engine.submit_ticket(cmd.order_id, cmd.itsm_ticket_id).await
        }
        CommandType::ApproveTicket => {
            let cmd: ApproveTicket = decode(env)?;
            for id in engine.approve_ticket(&cmd).await? {
                if let Err(e) = engine.dispatch(&id).await {
                    tracing::error!(suborder_id = %id, "❌ [commands] dispatch failed: {}", e);
                }
            }
            Ok(())
        }
        CommandType::StartOrder => {
            let cmd: OrderCommand = decode(env)?;
            engine.start_order(&cmd.suborder_id).await
        }
        CommandType::PauseOrder => {
            let cmd: OrderCommand = decode(env)?;
            engine.pause_order(&cmd.suborder_id).await
        }
        CommandType::TerminateOrder => {
            let cmd: TerminateOrder = decode(env)?;
            let reason = format!("terminated via {}", env.source);
            engine
                .terminate_order(&cmd.suborder_id, cmd.graceful, &reason)
                .await
        }
        CommandType::ModifyOrder => {
            let cmd: ModifyOrder = decode(env)?;
            engine.modify_order(&cmd).await.map(|_| ())
        }
        CommandType::ManualMatch => {
            let cmd: ManualMatch = decode(env)?;
            engine.manual_match(&cmd).await.map(|_| ())
        }
    }
}

/// Subscribe to the command channel and handle each message on its own task.
pub async fn listen(client: redis::Client, engine: Engine) -> anyhow::Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_SUPPLY_COMMANDS).await?;
    tracing::info!("🎧 [commands] listening on Redis channel '{}'", CHANNEL_SUPPLY_COMMANDS);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ [commands] unreadable message: {}", e);
                continue;
            }
        };
        let env: CommandEnvelope = match serde_json::from_str(&payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("⚠️ [commands] ignoring malformed command: {} ({})", e, payload);
                continue;
            }
        };
        tracing::info!(
            command_id = %env.command_id,
            "📩 [commands] {} from {}",
            env.command_type.as_str(),
            env.source
        );
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(&engine, &env).await {
                tracing::error!(
                    command_id = %env.command_id,
                    "❌ [commands] {} failed: {}",
                    env.command_type.as_str(),
                    e
                );
            }
        });
    }
    anyhow::bail!("command channel closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::workflow::tests::{cvm_request, engine};
    use serde_json::json;
    use std::sync::Arc;
    use supply_common::{OrderStatus, TicketStage};
    use supply_providers::mock::MockCloud;

    fn cmd(kind: CommandType, payload: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope::new(kind, payload, "test")
    }

    #[tokio::test(start_paused = true)]
    async fn approval_command_dispatches_new_orders() {
        let cloud = Arc::new(MockCloud::new());
        cloud.add_zone("gz", "gz-1", 4, &[]);
        let (engine, store) = engine(cloud, false);
        let t = engine
            .create_ticket(900, "erin", vec![cvm_request("gz-1", 2)])
            .await
            .unwrap();

        handle(&engine, &cmd(CommandType::SubmitTicket, json!({ "order_id": t.order_id })))
            .await
            .unwrap();
        handle(
            &engine,
            &cmd(
                CommandType::ApproveTicket,
                json!({ "order_id": t.order_id, "approved": true, "operator": "lead" }),
            ),
        )
        .await
        .unwrap();

        let order = store.get_order("1-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Done);
        let ticket = store.get_ticket(1).await.unwrap().unwrap();
        assert_eq!(ticket.stage, TicketStage::Done);
    }

    #[tokio::test]
    async fn pause_then_terminate() {
        let cloud = Arc::new(MockCloud::new());
        let (engine, store) = engine(cloud, false);
        crate::workflow::tests::approved(&engine, vec![cvm_request("gz-1", 1)]).await;

        handle(&engine, &cmd(CommandType::PauseOrder, json!({ "suborder_id": "1-1" })))
            .await
            .unwrap();
        assert_eq!(
            store.get_order("1-1").await.unwrap().unwrap().status,
            OrderStatus::Paused
        );
        handle(
            &engine,
            &cmd(
                CommandType::TerminateOrder,
                json!({ "suborder_id": "1-1", "graceful": true }),
            ),
        )
        .await
        .unwrap();
        let order = store.get_order("1-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::GracefulTerminate);
        assert_eq!(order.message, "terminated via test");
    }

    #[tokio::test]
    async fn malformed_payload_is_a_bad_command() {
        let cloud = Arc::new(MockCloud::new());
        let (engine, store) = engine(cloud, false);
        let err = handle(&engine, &cmd(CommandType::StartOrder, json!({ "nope": 1 })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::BadCommand {
                command: "CMD:START_ORDER",
                ..
            }
        ));
        assert!(!err.is_transient());

        let order = store.get_order("1-1").await.unwrap();
        assert!(order.is_none());
    }
}
