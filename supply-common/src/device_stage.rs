use serde::{Deserialize, Serialize};

/// Where a provisioned device is in its delivery lifecycle.
///
/// Stages are ordered; a device only moves forward, one stage at a time, except that
/// `Inited -> Delivering` is allowed when disk check is not part of the order.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum DeviceStage {
    /// Persisted by the generator, not yet touched by any stage executor.
    #[default]
    Generated,
    /// Ownership verified in CMDB (device sits in the staging business).
    Checked,
    Inited,
    DiskChecked,
    /// Transfer to the target business has been issued.
    Delivering,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal device stage transition {from:?} -> {to:?}")]
pub struct StageTransitionError {
    pub from: DeviceStage,
    pub to: DeviceStage,
}

impl DeviceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStage::Generated => "generated",
            DeviceStage::Checked => "checked",
            DeviceStage::Inited => "inited",
            DeviceStage::DiskChecked => "disk_checked",
            DeviceStage::Delivering => "delivering",
            DeviceStage::Delivered => "delivered",
        }
    }

    pub fn can_transition_to(self, next: DeviceStage) -> bool {
        use DeviceStage::*;
        next == self
            || matches!(
                (self, next),
                (Generated, Checked)
                    | (Checked, Inited)
                    | (Inited, DiskChecked)
                    | (Inited, Delivering)
                    | (DiskChecked, Delivering)
                    | (Delivering, Delivered)
            )
    }

    /// Returns the new stage, or an error when the move would skip or rewind a stage.
    /// Re-entering the current stage is allowed so retries stay idempotent.
    pub fn advance(self, next: DeviceStage) -> Result<DeviceStage, StageTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StageTransitionError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_checked(&self) -> bool {
        *self >= DeviceStage::Checked
    }

    pub fn is_inited(&self) -> bool {
        *self >= DeviceStage::Inited
    }

    /// Past the disk-check gate, either checked or skipped.
    pub fn is_disk_checked(&self) -> bool {
        *self >= DeviceStage::DiskChecked
    }

    pub fn is_delivered(&self) -> bool {
        *self == DeviceStage::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_with_disk_check() {
        let mut s = DeviceStage::default();
        for next in [
            DeviceStage::Checked,
            DeviceStage::Inited,
            DeviceStage::DiskChecked,
            DeviceStage::Delivering,
            DeviceStage::Delivered,
        ] {
            s = s.advance(next).unwrap();
        }
        assert!(s.is_delivered());
    }

    #[test]
    fn disk_check_may_be_skipped() {
        let s = DeviceStage::Inited.advance(DeviceStage::Delivering).unwrap();
        assert!(s.is_disk_checked());
        assert!(!s.is_delivered());
    }

    #[test]
    fn no_skipping_or_rewinding() {
        assert!(DeviceStage::Generated.advance(DeviceStage::Inited).is_err());
        assert!(DeviceStage::Checked.advance(DeviceStage::Delivered).is_err());
        let err = DeviceStage::Delivered
            .advance(DeviceStage::Inited)
            .unwrap_err();
        assert_eq!(err.from, DeviceStage::Delivered);
        assert_eq!(err.to, DeviceStage::Inited);
    }

    #[test]
    fn reentry_is_idempotent() {
        assert_eq!(
            DeviceStage::Delivering.advance(DeviceStage::Delivering),
            Ok(DeviceStage::Delivering)
        );
    }
}
