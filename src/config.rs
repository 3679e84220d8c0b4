use std::fmt;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::karma::markers::{ReactionMarkers, DEFAULT_NEGATIVE, DEFAULT_POSITIVE};

pub const DEFAULT_RESPONSE_FREQ_US: i64 = 5_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvDriver {
    Sled,
    Sqlite,
}

impl KvDriver {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "sled" => Ok(KvDriver::Sled),
            "sqlite" | "sqlite3" => Ok(KvDriver::Sqlite),
            other => Err(ConfigError::Invalid {
                key: "KARMA_KV_DRIVER",
                reason: format!("unknown driver {other:?}"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KvDriver::Sled => "sled",
            KvDriver::Sqlite => "sqlite3",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerDriver {
    Sqlite,
}

impl LedgerDriver {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(LedgerDriver::Sqlite),
            other => Err(ConfigError::Invalid {
                key: "KARMA_DB_TYPE",
                reason: format!("unsupported ledger driver {other:?}"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerDriver::Sqlite => "sqlite3",
        }
    }
}

#[derive(Clone)]
pub struct Config {
    /// The bot's own user id; its messages are never dispatched.
    pub username: String,
    pub db_dir: PathBuf,
    pub ledger_driver: LedgerDriver,
    pub ledger_dsn: String,
    pub kv_driver: KvDriver,
    /// Rate-limit interval in microseconds.
    pub response_freq_us: i64,
    pub positive_markers: String,
    pub negative_markers: String,
    pub sigil: char,
    pub hash_key: Option<Vec<u8>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("db_dir", &self.db_dir)
            .field("ledger_driver", &self.ledger_driver)
            .field("ledger_dsn", &self.ledger_dsn)
            .field("kv_driver", &self.kv_driver)
            .field("response_freq_us", &self.response_freq_us)
            .field("positive_markers", &self.positive_markers)
            .field("negative_markers", &self.negative_markers)
            .field("sigil", &self.sigil)
            .field("hash_key", &self.hash_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any variable source, then validate.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = get("KARMA_USERNAME").ok_or(ConfigError::Missing("KARMA_USERNAME"))?;
        let db_dir = PathBuf::from(get("KARMA_DB_DIR").unwrap_or_else(|| "./karma-data".to_string()));
        let ledger_driver = LedgerDriver::parse(&get("KARMA_DB_TYPE").unwrap_or_else(|| "sqlite3".to_string()))?;
        let ledger_dsn = get("KARMA_DB_DSN").unwrap_or_else(|| {
            db_dir
                .join("sqlite3")
                .join("data.sqlite3")
                .to_string_lossy()
                .into_owned()
        });
        let kv_driver = KvDriver::parse(&get("KARMA_KV_DRIVER").unwrap_or_else(|| "sled".to_string()))?;
        let response_freq_us = match get("KARMA_RESPONSE_FREQ") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| ConfigError::Invalid {
                key: "KARMA_RESPONSE_FREQ",
                reason: e.to_string(),
            })?,
            None => DEFAULT_RESPONSE_FREQ_US,
        };
        let sigil = match get("KARMA_SIGIL") {
            Some(raw) => {
                let mut chars = raw.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(ConfigError::Invalid {
                            key: "KARMA_SIGIL",
                            reason: format!("expected a single character, got {raw:?}"),
                        })
                    }
                }
            }
            None => '!',
        };
        let hash_key = match get("KARMA_HASH_KEY") {
            Some(raw) => Some(hex::decode(raw.trim()).map_err(|e| ConfigError::Invalid {
                key: "KARMA_HASH_KEY",
                reason: e.to_string(),
            })?),
            None => None,
        };

        let cfg = Self {
            username,
            db_dir,
            ledger_driver,
            ledger_dsn,
            kv_driver,
            response_freq_us,
            positive_markers: get("KARMA_POSITIVE").unwrap_or_else(|| DEFAULT_POSITIVE.to_string()),
            negative_markers: get("KARMA_NEGATIVE").unwrap_or_else(|| DEFAULT_NEGATIVE.to_string()),
            sigil,
            hash_key,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("KARMA_USERNAME"));
        }
        if self.response_freq_us <= 0 {
            return Err(ConfigError::Invalid {
                key: "KARMA_RESPONSE_FREQ",
                reason: "must be a positive number of microseconds".into(),
            });
        }
        if self.sigil.is_alphanumeric() || self.sigil.is_whitespace() {
            return Err(ConfigError::Invalid {
                key: "KARMA_SIGIL",
                reason: format!("{:?} cannot start a command", self.sigil),
            });
        }
        if matches!(&self.hash_key, Some(k) if k.is_empty()) {
            return Err(ConfigError::Invalid {
                key: "KARMA_HASH_KEY",
                reason: "key must not be empty".into(),
            });
        }
        self.markers()?;
        Ok(())
    }

    pub fn markers(&self) -> Result<ReactionMarkers, ConfigError> {
        ReactionMarkers::parse(&self.positive_markers, &self.negative_markers)
    }

    pub fn kv_path(&self) -> PathBuf {
        match self.kv_driver {
            KvDriver::Sled => self.db_dir.join("sled"),
            KvDriver::Sqlite => self.db_dir.join("kv").join("state.sqlite3"),
        }
    }
}
