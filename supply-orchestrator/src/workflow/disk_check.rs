use chrono::Utc;
use supply_common::{ApplyOrder, DeviceInfo, DeviceStage, StageKind};

use super::task::run_stage_task;
use super::Engine;
use crate::error::Result;

pub(crate) async fn run(engine: &Engine, order: &ApplyOrder, mut device: DeviceInfo) -> Result<DeviceInfo> {
    if device.stage.is_disk_checked() {
        return Ok(device);
    }
    // refuse early, before launching a task on a host that was never inited
    let next = device.stage.advance(DeviceStage::DiskChecked)?;
    let rec = run_stage_task(engine, StageKind::DiskCheck, &device).await?;
    device.stage = next;
    device.disk_check_task = rec.task_id;
    device.update_at = Utc::now();
    engine.store.update_device(&device).await?;
    tracing::debug!(suborder_id = %order.suborder_id, "[diskcheck] {} passed", device.ip);
    Ok(device)
}
