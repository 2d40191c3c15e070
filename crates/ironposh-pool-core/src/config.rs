use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::PoolError;

/// Where runspaces created by a pool connect to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionInfo {
    /// A runspace on the local machine.
    #[default]
    Local,
    /// A remote shell reached over SSH.
    Ssh {
        host: String,
        user_name: String,
        #[serde(default)]
        key_file: Option<PathBuf>,
    },
}

impl ConnectionInfo {
    pub fn ssh(
        host: impl Into<String>,
        user_name: impl Into<String>,
        key_file: Option<PathBuf>,
    ) -> Result<Self, PoolError> {
        let host = host.into();
        let user_name = user_name.into();

        if host.trim().is_empty() {
            return Err(PoolError::InvalidConfig("host name is required".into()));
        }
        if user_name.trim().is_empty() {
            return Err(PoolError::InvalidConfig("user name is required".into()));
        }

        Ok(ConnectionInfo::Ssh {
            host,
            user_name,
            key_file,
        })
    }

    pub fn target(&self) -> &str {
        match self {
            ConnectionInfo::Local => "localhost",
            ConnectionInfo::Ssh { host, .. } => host,
        }
    }
}

fn default_max_size() -> usize {
    4
}

fn default_max_rent_count() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, typed_builder::TypedBuilder, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on runspaces held by the pool, rented or idle.
    #[builder(default = default_max_size())]
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Runspaces created up front by `ensure_min_size`.
    #[builder(default = 0)]
    #[serde(default)]
    pub min_size: usize,

    /// Number of leases after which a runspace is retired instead of reused.
    #[builder(default = default_max_rent_count())]
    #[serde(default = "default_max_rent_count")]
    pub max_rent_count: u32,

    #[builder(default)]
    #[serde(default)]
    pub connection: ConnectionInfo,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::builder().build()
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_size must be at least 1".into(),
            ));
        }

        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }

        if self.max_rent_count == 0 {
            return Err(PoolError::InvalidConfig(
                "max_rent_count must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
