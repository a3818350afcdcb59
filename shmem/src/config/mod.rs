use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::queue::{OpenMode, OverflowPolicy};
use crate::region::{validate_geometry, validate_name, Permissions};

pub static DEFAULT_QUEUE_NAME: &str = "reliable_queue";

/// Everything needed to attach a queue handle.
///
/// In a TOML file:
///
/// ```toml
/// name = "app_log"
/// capacity = 256
/// block_size = 1024
/// permissions = 0o600
/// overflow_policy = "block"
/// open_mode = "open_or_create"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub capacity: u32,
    pub block_size: u32,
    pub permissions: u32,
    pub overflow_policy: OverflowPolicy,
    pub open_mode: OpenMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: DEFAULT_QUEUE_NAME.to_string(),
            capacity: 256,
            block_size: 1024,
            permissions: Permissions::default().mode(),
            overflow_policy: OverflowPolicy::default(),
            open_mode: OpenMode::default(),
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Loads and validates a TOML file. A missing file is created with defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<QueueConfig> {
        let cfg: QueueConfig = confy::load_path(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        // Geometry of an existing queue wins over ours, so only creators need a valid one.
        if self.open_mode != OpenMode::OpenOnly {
            validate_geometry(self.capacity, self.block_size)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct QueueConfigBuilder {
    cfg: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.name = name.into();
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.cfg.capacity = capacity;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.cfg.block_size = block_size;
        self
    }

    pub fn permissions(mut self, perms: Permissions) -> Self {
        self.cfg.permissions = perms.mode();
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.cfg.overflow_policy = policy;
        self
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.cfg.open_mode = mode;
        self
    }

    pub fn build(self) -> Result<QueueConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
