use chrono::Utc;
use supply_common::{DeviceInfo, RecordStatus, StageKind, StageRecord};
use supply_providers::inventory::{CreateTask, TaskState};

use super::Engine;
use crate::error::{OrchestratorError, Result};
use crate::retry::poll_until;

/// Task names are unique per stage, suborder and device so a restarted process can find
/// the task it already launched.
pub(crate) fn task_name(kind: StageKind, device: &DeviceInfo) -> String {
    format!("{}-{}-{}", kind.as_str(), device.suborder_id, device.ip)
}

/// First task listed under `name` whose status can still be queried.
async fn adoptable_task(
    engine: &Engine,
    staging: i64,
    name: &str,
) -> Result<Option<(String, String)>> {
    let sops = &engine.clients.sops;
    for t in sops.get_task_list(staging, name).await? {
        match sops.get_task_detail(staging, &t.task_id).await {
            Ok(_) => return Ok(Some((t.task_id, t.link))),
            Err(e) => {
                tracing::debug!("[task] {} skips task {}: {}", name, t.task_id, e);
            }
        }
    }
    Ok(None)
}

/// Run the SOPS task of one stage for one device and wait for its end.
///
/// A record still in Init adopts a task launched before a crash; a Failed one launches a
/// fresh task.
pub(crate) async fn run_stage_task(
    engine: &Engine,
    kind: StageKind,
    device: &DeviceInfo,
) -> Result<StageRecord> {
    let store = engine.store.as_ref();
    let staging = engine.cfg.staging_biz_id;
    let mut rec = match store
        .get_stage_record(kind, &device.suborder_id, &device.ip)
        .await?
    {
        Some(r) => r,
        None => {
            let r = StageRecord::new(kind, device);
            store.upsert_stage_record(&r).await?;
            r
        }
    };
    if rec.status == RecordStatus::Success {
        return Ok(rec);
    }

    let name = task_name(kind, device);
    let adopted = if rec.status == RecordStatus::Failed {
        None
    } else if !rec.task_id.is_empty() {
        Some((rec.task_id.clone(), rec.task_link.clone()))
    } else {
        adoptable_task(engine, staging, &name).await?
    };
    let (task_id, link) = match adopted {
        Some(found) => {
            tracing::info!("🔁 [task] {} adopts existing task {}", name, found.0);
            found
        }
        None => {
            let task = engine
                .clients
                .sops
                .create_task(&CreateTask {
                    bk_biz_id: staging,
                    name: name.clone(),
                    template: kind.as_str().to_string(),
                    ips: vec![device.ip.clone()],
                })
                .await?;
            (task.task_id, task.link)
        }
    };

    rec.status = RecordStatus::Handling;
    rec.task_id = task_id.clone();
    rec.task_link = link;
    rec.message.clear();
    rec.update_at = Utc::now();
    store.upsert_stage_record(&rec).await?;

    let sops = &engine.clients.sops;
    let what = format!("task {}", task_id);
    let waited = poll_until(&what, engine.cfg.budgets.sops_task, || {
        let task_id = task_id.as_str();
        async move {
            let detail = sops.get_task_detail(staging, task_id).await?;
            Ok::<_, OrchestratorError>(detail.state.is_done().then_some(detail))
        }
    })
    .await;

    rec.update_at = Utc::now();
    match waited {
        Ok(detail) if detail.state == TaskState::Finished => {
            rec.status = RecordStatus::Success;
            store.upsert_stage_record(&rec).await?;
            Ok(rec)
        }
        Ok(detail) => {
            rec.status = RecordStatus::Failed;
            rec.message = if detail.message.is_empty() {
                format!("task ended {:?}", detail.state)
            } else {
                detail.message
            };
            store.upsert_stage_record(&rec).await?;
            Err(OrchestratorError::TaskFailed {
                task_id,
                message: rec.message,
            })
        }
        Err(e) => {
            rec.status = RecordStatus::Failed;
            rec.message = e.to_string();
            store.upsert_stage_record(&rec).await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::workflow::tests::{engine, STAGING};
    use std::sync::Arc;
    use supply_common::*;
    use supply_providers::inventory::SopsTask;
    use supply_providers::mock::MockCloud;

    fn device() -> DeviceInfo {
        let ticket = ApplyTicket::new(8, 900, "erin", vec![]);
        let order = ApplyOrder::from_request(
            &ticket,
            0,
            &SuborderRequest {
                resource_type: ResourceType::IdcPm,
                spec: ResourceSpec::default(),
                replicas: 1,
                remark: String::new(),
                enable_disk_check: false,
            },
        );
        DeviceInfo::new(&order, 1, "10.3.0.7", "A7")
    }

    #[tokio::test(start_paused = true)]
    async fn adopts_a_task_launched_before_restart() {
        let cloud = Arc::new(MockCloud::new());
        let d = device();
        cloud.seed_task(SopsTask {
            task_id: "task-old".into(),
            name: task_name(StageKind::Init, &d),
            bk_biz_id: STAGING,
            link: String::new(),
        });
        let (engine, store) = engine(cloud.clone(), false);

        let rec = run_stage_task(&engine, StageKind::Init, &d).await.unwrap();
        assert_eq!(rec.task_id, "task-old");
        assert_eq!(rec.status, RecordStatus::Success);
        assert_eq!(cloud.counters().sops_create, 0);
        let stored = store
            .get_stage_record(StageKind::Init, &d.suborder_id, &d.ip)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RecordStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_tasks_are_passed_over() {
        let cloud = Arc::new(MockCloud::new());
        let d = device();
        let name = task_name(StageKind::Init, &d);
        cloud.seed_stale_task(SopsTask {
            task_id: "task-gone".into(),
            name: name.clone(),
            bk_biz_id: STAGING,
            link: String::new(),
        });
        cloud.seed_task(SopsTask {
            task_id: "task-live".into(),
            name,
            bk_biz_id: STAGING,
            link: String::new(),
        });
        let (engine, _store) = engine(cloud.clone(), false);

        let rec = run_stage_task(&engine, StageKind::Init, &d).await.unwrap();
        assert_eq!(rec.task_id, "task-live");
        assert_eq!(rec.status, RecordStatus::Success);
        assert_eq!(cloud.counters().sops_create, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_unreadable_tasks_means_a_new_one() {
        let cloud = Arc::new(MockCloud::new());
        let d = device();
        cloud.seed_stale_task(SopsTask {
            task_id: "task-gone".into(),
            name: task_name(StageKind::Init, &d),
            bk_biz_id: STAGING,
            link: String::new(),
        });
        let (engine, _store) = engine(cloud.clone(), false);

        let rec = run_stage_task(&engine, StageKind::Init, &d).await.unwrap();
        assert_ne!(rec.task_id, "task-gone");
        assert_eq!(rec.status, RecordStatus::Success);
        assert_eq!(cloud.counters().sops_create, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_records_get_a_fresh_task() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_tasks_for("10.3.0.7");
        let (engine, store) = engine(cloud.clone(), false);
        let d = device();

        let err = run_stage_task(&engine, StageKind::Init, &d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskFailed { .. }));
        let first = store
            .get_stage_record(StageKind::Init, &d.suborder_id, &d.ip)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, RecordStatus::Failed);

        assert!(run_stage_task(&engine, StageKind::Init, &d).await.is_err());
        assert_eq!(cloud.counters().sops_create, 2);
    }
}
