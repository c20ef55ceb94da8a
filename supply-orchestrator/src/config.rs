use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::retry::PollBudgets;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dvm spec table: {0}")]
    Specs(#[from] serde_json::Error),
    #[error("no dvm spec configured for device type {0}")]
    UnknownDeviceType(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Gateway,
    Mock,
}

/// Per device type docker VM shape.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DvmSpec {
    pub cores: u32,
    pub mem_gb: u32,
    pub disk_gb: u32,
    /// Empty accepts any cpu vendor.
    #[serde(default)]
    pub cpu_provider: String,
    #[serde(default = "default_network_type")]
    pub network_type: String,
}

fn default_network_type() -> String {
    "overlay".to_string()
}

#[derive(Clone, Debug, Default)]
pub struct DvmSpecTable {
    specs: HashMap<String, DvmSpec>,
}

impl DvmSpecTable {
    pub fn builtin() -> Self {
        let mut t = Self::default();
        for (name, cores, mem_gb, disk_gb) in [
            ("DOCKERVM.2C4G", 2, 4, 50),
            ("DOCKERVM.4C8G", 4, 8, 100),
            ("DOCKERVM.8C16G", 8, 16, 200),
            ("DOCKERVM.16C32G", 16, 32, 400),
            ("DOCKERVM.32C64G", 32, 64, 800),
        ] {
            t.insert(
                name,
                DvmSpec {
                    cores,
                    mem_gb,
                    disk_gb,
                    cpu_provider: String::new(),
                    network_type: default_network_type(),
                },
            );
        }
        t
    }

    /// JSON object keyed by device type.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let specs: HashMap<String, DvmSpec> = serde_json::from_str(raw)?;
        Ok(Self { specs })
    }

    pub fn insert(&mut self, device_type: &str, spec: DvmSpec) {
        self.specs.insert(device_type.to_string(), spec);
    }

    pub fn get(&self, device_type: &str) -> Result<&DvmSpec, ConfigError> {
        self.specs
            .get(device_type)
            .ok_or_else(|| ConfigError::UnknownDeviceType(device_type.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub port: u16,
    pub backend: Backend,
    pub gateway_url: String,
    pub gateway_token: String,
    /// Business that parks hosts between provisioning and delivery.
    pub staging_biz_id: i64,
    /// Business that owns idle physical machines.
    pub pool_biz_id: i64,
    pub recover_expire_days: i64,
    /// Forces the disk check step on every new suborder.
    pub enable_disk_check: bool,
    pub dvm_specs: DvmSpecTable,
    pub dispatch_interval: Duration,
    pub operator: String,
    pub concurrency: usize,
    pub budgets: PollBudgets,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            port: 8001,
            backend: Backend::Gateway,
            gateway_url: String::new(),
            gateway_token: String::new(),
            staging_biz_id: 5_000_001,
            pool_biz_id: 5_000_002,
            recover_expire_days: 3,
            enable_disk_check: false,
            dvm_specs: DvmSpecTable::builtin(),
            dispatch_interval: Duration::from_secs(10),
            operator: "supply".to_string(),
            concurrency: 5,
            budgets: PollBudgets::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut s = Settings::default();

        s.database_url = get("DATABASE_URL");
        s.redis_url = get("REDIS_URL");
        if let Some(v) = get("ORCHESTRATOR_PORT") {
            s.port = parse("ORCHESTRATOR_PORT", &v)?;
        }
        s.backend = match get("SUPPLY_BACKEND").as_deref() {
            None | Some("gateway") => Backend::Gateway,
            Some("mock") => Backend::Mock,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "SUPPLY_BACKEND",
                    value: other.to_string(),
                })
            }
        };
        if s.backend == Backend::Gateway {
            s.gateway_url = get("SUPPLY_GATEWAY_URL").ok_or(ConfigError::Missing("SUPPLY_GATEWAY_URL"))?;
            // Prefer *_FILE for secrets, fallback to the plain env var.
            s.gateway_token = match get("SUPPLY_GATEWAY_TOKEN_FILE") {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?
                    .trim()
                    .to_string(),
                None => get("SUPPLY_GATEWAY_TOKEN").unwrap_or_default(),
            };
        }
        if let Some(v) = get("SUPPLY_STAGING_BIZ_ID") {
            s.staging_biz_id = parse("SUPPLY_STAGING_BIZ_ID", &v)?;
        }
        if let Some(v) = get("SUPPLY_POOL_BIZ_ID") {
            s.pool_biz_id = parse("SUPPLY_POOL_BIZ_ID", &v)?;
        }
        if let Some(v) = get("SUPPLY_RECOVER_EXPIRE_DAYS") {
            s.recover_expire_days = parse("SUPPLY_RECOVER_EXPIRE_DAYS", &v)?;
        }
        if let Some(v) = get("SUPPLY_ENABLE_DISK_CHECK") {
            s.enable_disk_check = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "SUPPLY_ENABLE_DISK_CHECK",
                        value: v,
                    })
                }
            };
        }
        if let Some(path) = get("SUPPLY_DVM_SPECS_FILE") {
            let raw = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Read { path, source })?;
            s.dvm_specs = DvmSpecTable::from_json(&raw)?;
        }
        if let Some(v) = get("SUPPLY_DISPATCH_INTERVAL_SECS") {
            s.dispatch_interval = Duration::from_secs(parse("SUPPLY_DISPATCH_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("SUPPLY_OPERATOR") {
            s.operator = v;
        }
        if let Some(v) = get("SUPPLY_CONCURRENCY") {
            s.concurrency = parse("SUPPLY_CONCURRENCY", &v)?;
            if s.concurrency == 0 {
                return Err(ConfigError::Invalid {
                    key: "SUPPLY_CONCURRENCY",
                    value: v,
                });
            }
        }
        Ok(s)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
