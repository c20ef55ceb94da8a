//! Device initialisation: confirm the host still sits in the staging business, then run the
//! init task on it.

use chrono::Utc;
use supply_common::{ApplyOrder, DeviceInfo, DeviceStage, StageKind};

use super::task::run_stage_task;
use super::Engine;
use crate::error::{OrchestratorError, Result};

/// Business the CMDB currently files `device` under.
pub(crate) async fn current_biz(engine: &Engine, device: &DeviceInfo) -> Result<i64> {
    engine
        .clients
        .cmdb
        .get_host_biz_ids(std::slice::from_ref(&device.asset_id))
        .await?
        .into_iter()
        .find(|b| b.asset_id == device.asset_id)
        .map(|b| b.bk_biz_id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("host {}", device.asset_id)))
}

pub(crate) async fn run(engine: &Engine, order: &ApplyOrder, mut device: DeviceInfo) -> Result<DeviceInfo> {
    if device.stage.is_inited() {
        return Ok(device);
    }
    let store = engine.store.as_ref();

    if !device.stage.is_checked() {
        let biz = current_biz(engine, &device).await?;
        if biz != engine.cfg.staging_biz_id {
            return Err(OrchestratorError::DeviceDrifted {
                asset_id: device.asset_id.clone(),
                bk_biz_id: biz,
            });
        }
        device.stage = device.stage.advance(DeviceStage::Checked)?;
        device.update_at = Utc::now();
        store.update_device(&device).await?;
    }

    let rec = run_stage_task(engine, StageKind::Init, &device).await?;
    device.stage = device.stage.advance(DeviceStage::Inited)?;
    device.init_task = rec.task_id;
    device.update_at = Utc::now();
    store.update_device(&device).await?;
    tracing::debug!(suborder_id = %order.suborder_id, "[init] {} inited", device.ip);
    Ok(device)
}
