//! Target descriptor consumed by the lowering pass.

use crate::ir::DeviceApi;

/// The subset of target information the pass cares about: which device
/// APIs the schedule may use, and which runtime instrumentation the
/// generated program should carry.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub device_apis: Vec<DeviceApi>,
    /// Strip all runtime assertions from the generated program.
    pub no_asserts: bool,
    /// Emit memory-sanitizer "is initialized" annotations around extern
    /// calls.
    pub msan: bool,
}

impl Target {
    pub fn host() -> Self {
        Self {
            device_apis: vec![DeviceApi::Host],
            no_asserts: false,
            msan: false,
        }
    }

    pub fn supports_device_api(&self, api: DeviceApi) -> bool {
        matches!(api, DeviceApi::None | DeviceApi::Host) || self.device_apis.contains(&api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_supports_plain_loops_only() {
        let t = Target::host();
        assert!(t.supports_device_api(DeviceApi::None));
        assert!(t.supports_device_api(DeviceApi::Host));
        assert!(!t.supports_device_api(DeviceApi::Cuda));
    }
}
