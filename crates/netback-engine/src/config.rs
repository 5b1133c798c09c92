//! Engine-wide configuration.
//!
//! Values come from [`NetbackConfig::default`] and may be overridden through `NETBACK_*`
//! environment variables. Per-interface settings are passed at connect time instead (see
//! [`crate::InterfaceParams`]).

use std::str::FromStr;
use std::time::Duration;

use netback_grant::PAGE_SIZE;

use crate::error::ConfigError;

/// In-flight guest page capabilities per worker group.
pub const MAX_PENDING: usize = 256;

/// Hard cap on ring slots in one TX frame. Frames beyond it disable the interface.
pub const DEFAULT_MAX_FRAME_SLOTS: usize = 18;

/// Bytes of each TX frame that are always copied rather than mapped.
pub const DEFAULT_HEADER_COPY_LEN: usize = 128;

/// Extra-info records allowed after one TX request.
pub const MAX_EXTRA_INFO: usize = 4;

pub const ETH_HLEN: usize = 14;

/// Largest TX frame accepted before it is dropped as oversized.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 65535 + ETH_HLEN;

pub const DEFAULT_TX_BATCH_FRAMES: usize = 64;
pub const DEFAULT_RX_BATCH_FRAMES: usize = 64;
pub const DEFAULT_RX_QUEUE_FRAMES: usize = 256;
pub const DEFAULT_RX_STALL_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_TRANSFER_POOL_PAGES: usize = 64;
pub const DEFAULT_TRANSFER_BACKOFF: Duration = Duration::from_millis(10);
pub const DEFAULT_NOTIFY_BATCH: usize = 32;
pub const DEFAULT_GRANT_RETRIES: usize = 8;
pub const DEFAULT_UNMAP_RETRY: Duration = Duration::from_millis(10);

/// How TX payload beyond the copied header reaches the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxCopyMode {
    /// Map guest pages and hand them up zero-copy; they are unmapped once the stack lets go.
    #[default]
    MapFragments,
    /// Copy every byte into host memory; no guest page stays mapped.
    CopyAll,
}

/// How a worker group's TX, RX and deallocation passes are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionModel {
    /// One long-lived thread per group, sleeping until work or a timer is due.
    #[default]
    Threaded,
    /// No threads. The embedder calls [`crate::Netback::run_deferred`] to run pending passes.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetbackConfig {
    pub worker_groups: usize,
    pub execution: ExecutionModel,
    pub max_pending: usize,
    pub max_frame_slots: usize,
    pub max_frame_bytes: usize,
    pub header_copy_len: usize,
    pub tx_copy_mode: TxCopyMode,
    /// Frames built per TX pass before yielding to other work.
    pub tx_batch_frames: usize,
    /// Frames delivered per RX pass before yielding.
    pub rx_batch_frames: usize,
    /// Frames held per interface while its RX ring lacks room.
    pub rx_queue_frames: usize,
    pub rx_stall_timeout: Duration,
    pub transfer_pool_pages: usize,
    pub transfer_backoff: Duration,
    /// Ports signalled per batched notify call.
    pub notify_batch: usize,
    /// Individual retries of a copy that returned "try again".
    pub grant_retries: usize,
    pub unmap_retry: Duration,
    /// Copy out and unmap TX fragments the host stack holds longer than this.
    pub copy_back_after: Option<Duration>,
}

impl Default for NetbackConfig {
    fn default() -> Self {
        Self {
            worker_groups: 1,
            execution: ExecutionModel::default(),
            max_pending: MAX_PENDING,
            max_frame_slots: DEFAULT_MAX_FRAME_SLOTS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            header_copy_len: DEFAULT_HEADER_COPY_LEN,
            tx_copy_mode: TxCopyMode::default(),
            tx_batch_frames: DEFAULT_TX_BATCH_FRAMES,
            rx_batch_frames: DEFAULT_RX_BATCH_FRAMES,
            rx_queue_frames: DEFAULT_RX_QUEUE_FRAMES,
            rx_stall_timeout: DEFAULT_RX_STALL_TIMEOUT,
            transfer_pool_pages: DEFAULT_TRANSFER_POOL_PAGES,
            transfer_backoff: DEFAULT_TRANSFER_BACKOFF,
            notify_batch: DEFAULT_NOTIFY_BATCH,
            grant_retries: DEFAULT_GRANT_RETRIES,
            unmap_retry: DEFAULT_UNMAP_RETRY,
            copy_back_after: None,
        }
    }
}

impl NetbackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let get = |var: &'static str| lookup(var).map(|raw| (var, raw));

        if let Some((var, raw)) = get("NETBACK_WORKER_GROUPS") {
            cfg.worker_groups = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_EXECUTION") {
            cfg.execution = match raw.trim().to_ascii_lowercase().as_str() {
                "threaded" => ExecutionModel::Threaded,
                "deferred" => ExecutionModel::Deferred,
                _ => return Err(ConfigError::InvalidEnv { var, value: raw }),
            };
        }
        if let Some((var, raw)) = get("NETBACK_MAX_PENDING") {
            cfg.max_pending = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_MAX_FRAME_SLOTS") {
            cfg.max_frame_slots = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_HEADER_COPY_LEN") {
            cfg.header_copy_len = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_TX_COPY_MODE") {
            cfg.tx_copy_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "map" => TxCopyMode::MapFragments,
                "copy" => TxCopyMode::CopyAll,
                _ => return Err(ConfigError::InvalidEnv { var, value: raw }),
            };
        }
        if let Some((var, raw)) = get("NETBACK_RX_QUEUE_FRAMES") {
            cfg.rx_queue_frames = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_RX_STALL_TIMEOUT_MS") {
            cfg.rx_stall_timeout = Duration::from_millis(parse(var, &raw)?);
        }
        if let Some((var, raw)) = get("NETBACK_TRANSFER_POOL_PAGES") {
            cfg.transfer_pool_pages = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_NOTIFY_BATCH") {
            cfg.notify_batch = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("NETBACK_COPY_BACK_MS") {
            let ms: u64 = parse(var, &raw)?;
            cfg.copy_back_after = (ms > 0).then(|| Duration::from_millis(ms));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_groups == 0 {
            return Err(ConfigError::Invalid("worker_groups must be at least 1"));
        }
        if self.max_frame_slots == 0 {
            return Err(ConfigError::Invalid("max_frame_slots must be at least 1"));
        }
        // A pool smaller than one maximal frame could never admit that frame.
        if self.max_pending < self.max_frame_slots {
            return Err(ConfigError::Invalid(
                "max_pending must be at least max_frame_slots",
            ));
        }
        if self.max_pending > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid("max_pending must fit in 16 bits"));
        }
        if self.header_copy_len < ETH_HLEN || self.header_copy_len > PAGE_SIZE {
            return Err(ConfigError::Invalid(
                "header_copy_len must cover an Ethernet header and fit in a page",
            ));
        }
        if self.max_frame_bytes < ETH_HLEN || self.max_frame_bytes > DEFAULT_MAX_FRAME_BYTES {
            return Err(ConfigError::Invalid("max_frame_bytes out of range"));
        }
        if self.tx_batch_frames == 0 || self.rx_batch_frames == 0 {
            return Err(ConfigError::Invalid("batch sizes must be at least 1"));
        }
        if self.notify_batch == 0 {
            return Err(ConfigError::Invalid("notify_batch must be at least 1"));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn defaults_validate() {
        NetbackConfig::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = NetbackConfig::from_lookup(lookup(&[
            ("NETBACK_WORKER_GROUPS", "4"),
            ("NETBACK_EXECUTION", "Deferred"),
            ("NETBACK_TX_COPY_MODE", "copy"),
            ("NETBACK_COPY_BACK_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.worker_groups, 4);
        assert_eq!(cfg.execution, ExecutionModel::Deferred);
        assert_eq!(cfg.tx_copy_mode, TxCopyMode::CopyAll);
        assert_eq!(cfg.copy_back_after, Some(Duration::from_millis(250)));
        assert_eq!(cfg.max_pending, MAX_PENDING);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = NetbackConfig::from_lookup(lookup(&[("NETBACK_MAX_PENDING", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "NETBACK_MAX_PENDING",
                value: "lots".into()
            }
        );
    }

    #[test]
    fn pool_smaller_than_a_frame_is_rejected() {
        let cfg = NetbackConfig {
            max_pending: 8,
            ..NetbackConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
