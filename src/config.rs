//! Runtime configuration: device nodes, the fixed GPU virtual address layout, and
//! submission timing.
//!
//! Everything has a working default. [`GpuConfig::from_env`] layers the `NV_*`
//! environment overrides on top of those defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_DEVICE_INDEX: &str = "NV_DEVICE_INDEX";
pub const ENV_SUBMIT_TIMEOUT_MS: &str = "NV_SUBMIT_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "NV_POLL_INTERVAL_MS";

/// Paths of the three device nodes a context opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub control: PathBuf,
    pub uvm: PathBuf,
    pub gpu: PathBuf,
}

impl DevicePaths {
    /// The standard nodes for GPU minor number `index`.
    #[must_use]
    pub fn for_index(index: u32) -> Self {
        Self {
            control: PathBuf::from("/dev/nvidiactl"),
            uvm: PathBuf::from("/dev/nvidia-uvm"),
            gpu: PathBuf::from(format!("/dev/nvidia{index}")),
        }
    }
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self::for_index(0)
    }
}

/// Fixed GPU virtual addresses and offsets used by a channel.
///
/// The control region holds the GPFIFO ring followed by the USERD page. The push
/// buffer lives inside the same heap allocation, so the control region must
/// cover `pushbuf_base + cmdq_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuLayout {
    pub control_base: u64,
    pub control_len: u64,
    pub gpfifo_offset: u64,
    pub gpfifo_entries: u32,
    pub userd_offset: u64,
    /// GP_GET, relative to USERD. Doubles as the completion word.
    pub gp_get_offset: u64,
    /// GP_PUT, relative to USERD.
    pub gp_put_offset: u64,
    pub pushbuf_base: u64,
    pub cmdq_offset: u64,
    pub notifier_base: u64,
    pub notifier_len: u64,
    pub usermode_len: u64,
    pub doorbell_offset: u64,
    pub channel_uvm_base: u64,
    pub channel_uvm_len: u64,
}

impl Default for GpuLayout {
    fn default() -> Self {
        Self {
            control_base: 0x2_0040_0000,
            control_len: 0x20_0000,
            gpfifo_offset: 0,
            gpfifo_entries: 0x400,
            userd_offset: 0x2000,
            gp_get_offset: 0x88,
            gp_put_offset: 0x8c,
            pushbuf_base: 0x2_0050_0000,
            cmdq_offset: 0x6000,
            notifier_base: 0x7fff_f7ff_b000,
            notifier_len: 0x1000,
            usermode_len: 0x1_0000,
            doorbell_offset: 0x90,
            channel_uvm_base: 0x2_0360_0000,
            channel_uvm_len: 0xf6_e000,
        }
    }
}

impl GpuLayout {
    /// Rebases the control region, moving the push buffer with it.
    #[must_use]
    pub const fn with_control_base(mut self, base: u64) -> Self {
        let push_delta = self.pushbuf_base - self.control_base;
        self.control_base = base;
        self.pushbuf_base = base + push_delta;
        self
    }

    #[must_use]
    pub const fn with_notifier_base(mut self, base: u64) -> Self {
        self.notifier_base = base;
        self
    }

    #[must_use]
    pub const fn gpfifo_address(&self) -> u64 {
        self.control_base + self.gpfifo_offset
    }

    #[must_use]
    pub const fn userd_address(&self) -> u64 {
        self.control_base + self.userd_offset
    }

    #[must_use]
    pub const fn completion_address(&self) -> u64 {
        self.userd_address() + self.gp_get_offset
    }

    #[must_use]
    pub const fn gp_put_address(&self) -> u64 {
        self.userd_address() + self.gp_put_offset
    }

    #[must_use]
    pub const fn cmdq_address(&self) -> u64 {
        self.pushbuf_base + self.cmdq_offset
    }

    /// Bytes available to the push buffer ring before the control region ends.
    #[must_use]
    pub const fn cmdq_capacity(&self) -> u64 {
        (self.control_base + self.control_len).saturating_sub(self.cmdq_address())
    }
}

/// Top-level configuration for a [`DeviceContext`](crate::thunk::context::DeviceContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub device_index: u32,
    pub paths: DevicePaths,
    pub layout: GpuLayout,
    pub poll_interval: Duration,
    pub submit_timeout: Duration,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            paths: DevicePaths::default(),
            layout: GpuLayout::default(),
            poll_interval: Duration::from_millis(1),
            submit_timeout: Duration::from_millis(1000),
        }
    }
}

impl GpuConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects GPU `index`, updating the primary device path to match.
    #[must_use]
    pub fn with_device_index(mut self, index: u32) -> Self {
        self.device_index = index;
        self.paths.gpu = DevicePaths::for_index(index).gpu;
        self
    }

    #[must_use]
    pub fn with_paths(mut self, paths: DevicePaths) -> Self {
        self.paths = paths;
        self
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: GpuLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Defaults, overridden by `NV_DEVICE_INDEX`, `NV_SUBMIT_TIMEOUT_MS` and
    /// `NV_POLL_INTERVAL_MS` where set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparseable values are logged and skipped.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(index) = parse_override::<u32>(&lookup, ENV_DEVICE_INDEX) {
            self = self.with_device_index(index);
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_SUBMIT_TIMEOUT_MS) {
            self.submit_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_POLL_INTERVAL_MS) {
            self.poll_interval = Duration::from_millis(ms.max(1));
        }
        self
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    let parsed = trimmed
        .strip_prefix("0x")
        .map_or_else(
            || trimmed.parse::<T>().ok(),
            |hex| {
                u64::from_str_radix(hex, 16)
                    .ok()
                    .and_then(|v| v.to_string().parse::<T>().ok())
            },
        );
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring malformed override");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_layout_matches_channel_constants() {
        let layout = GpuLayout::default();
        assert_eq!(layout.completion_address(), 0x2_0040_2088);
        assert_eq!(layout.gp_put_address(), 0x2_0040_208c);
        assert_eq!(layout.cmdq_address(), 0x2_0050_6000);
        assert_eq!(layout.cmdq_capacity(), 0xFA000);
    }

    #[test]
    fn rebasing_moves_push_buffer_too() {
        let layout = GpuLayout::default().with_control_base(0x30_0000_0000);
        assert_eq!(layout.pushbuf_base, 0x30_0010_0000);
        assert_eq!(layout.cmdq_address(), 0x30_0010_6000);
    }

    #[test]
    fn overrides_apply_to_defaults() {
        let cfg = GpuConfig::default().with_overrides(lookup_from(&[
            (ENV_DEVICE_INDEX, "2"),
            (ENV_SUBMIT_TIMEOUT_MS, "250"),
            (ENV_POLL_INTERVAL_MS, "0x4"),
        ]));
        assert_eq!(cfg.device_index, 2);
        assert_eq!(cfg.paths.gpu, PathBuf::from("/dev/nvidia2"));
        assert_eq!(cfg.submit_timeout, Duration::from_millis(250));
        assert_eq!(cfg.poll_interval, Duration::from_millis(4));
    }

    #[test]
    fn malformed_override_is_ignored() {
        let cfg = GpuConfig::default().with_overrides(lookup_from(&[(ENV_DEVICE_INDEX, "gpu1")]));
        assert_eq!(cfg.device_index, 0);
        assert_eq!(cfg.paths, DevicePaths::default());
    }
}
