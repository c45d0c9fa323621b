//! RELAYMSG configuration: raw strings in, validated snapshot out.
//!
//! The raw values come from the environment (`RELAYMSG_*`). Loading either
//! produces a complete [`RelayConfig`] or an error; there is no partially
//! applied state. [`ConfigHandle`] holds the live snapshot and swaps it
//! wholesale on reload.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use super::dialect::{CapabilityGatedDialect, Dialect, PermissionGatedDialect};
use super::identity::{is_valid_host, is_valid_ident};
use super::nick::{ForbiddenChars, NickShape, NickValidator};

pub const DEFAULT_SEPARATOR: &str = "/";
pub const DEFAULT_NICKGLOB: &str = "*/*";
pub const DEFAULT_IDENT: &str = "relay";
pub const DEFAULT_PRIVILEGE: &str = "relaymsg";

/// Unvalidated configuration values, exactly as supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRelayConfig {
    /// `capability` (default) or `permission`.
    pub dialect: Option<String>,
    /// Capability dialect only.
    pub separator: Option<String>,
    /// Permission dialect only.
    pub nickglob: Option<String>,
    pub ident: Option<String>,
    /// Defaults to the local server name.
    pub host: Option<String>,
    /// Capability dialect: also require operator status (default `true`).
    pub require_oper: Option<String>,
    /// Permission dialect: privilege name (default `relaymsg`).
    pub privilege: Option<String>,
}

impl RawRelayConfig {
    /// Read `RELAYMSG_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read values through an arbitrary lookup (environment, test maps).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            dialect: get("RELAYMSG_DIALECT"),
            separator: get("RELAYMSG_SEPARATOR"),
            nickglob: get("RELAYMSG_NICKGLOB"),
            ident: get("RELAYMSG_IDENT"),
            host: get("RELAYMSG_HOST"),
            require_oper: get("RELAYMSG_REQUIRE_OPER"),
            privilege: get("RELAYMSG_PRIVILEGE"),
        }
    }
}

/// Why a configuration was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown RELAYMSG dialect {0:?} (expected \"capability\" or \"permission\")")]
    UnknownDialect(String),
    #[error("option {option} does not apply to the {dialect} dialect")]
    ConflictingShape {
        dialect: &'static str,
        option: &'static str,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{option} {value:?} can never match a valid spoofed nick")]
    Unmatchable { option: &'static str, value: String },
    #[error("invalid ident value {0:?}")]
    InvalidIdent(String),
    #[error("invalid host value {0:?}")]
    InvalidHost(String),
    #[error("invalid boolean {value:?} for {key}")]
    InvalidBool { key: &'static str, value: String },
}

/// Validated, immutable RELAYMSG settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    dialect: Arc<dyn Dialect>,
    fake_ident: String,
    fake_host: String,
    validator: NickValidator,
}

impl RelayConfig {
    /// Assemble a snapshot from an already-chosen dialect.
    pub fn new(
        dialect: Arc<dyn Dialect>,
        fake_ident: impl Into<String>,
        fake_host: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let fake_ident = fake_ident.into();
        let fake_host = fake_host.into();
        if !is_valid_ident(&fake_ident) {
            return Err(ConfigError::InvalidIdent(fake_ident));
        }
        if !is_valid_host(&fake_host) {
            return Err(ConfigError::InvalidHost(fake_host));
        }

        let forbidden = ForbiddenChars::new();
        let (option, value) = match dialect.nick_shape() {
            NickShape::RequiredSeparator(sep) => ("separator", sep),
            NickShape::GlobPattern(glob) => ("nickglob", glob),
        };
        if value.is_empty() {
            return Err(ConfigError::Empty(option));
        }
        let literal_forbidden = value
            .bytes()
            .any(|b| forbidden.contains(b) && !(option == "nickglob" && (b == b'*' || b == b'?')));
        if literal_forbidden {
            return Err(ConfigError::Unmatchable {
                option,
                value: value.clone(),
            });
        }

        Ok(Self {
            dialect,
            fake_ident,
            fake_host,
            validator: NickValidator::new(forbidden),
        })
    }

    /// Validate raw values. `server_name` is the default host.
    pub fn load(raw: &RawRelayConfig, server_name: &str) -> Result<Self, ConfigError> {
        let dialect_name = raw
            .dialect
            .as_deref()
            .map(|d| d.trim().to_ascii_lowercase())
            .unwrap_or_else(|| CapabilityGatedDialect::NAME.to_owned());

        let dialect: Arc<dyn Dialect> = match dialect_name.as_str() {
            CapabilityGatedDialect::NAME => {
                if raw.nickglob.is_some() {
                    return Err(ConfigError::ConflictingShape {
                        dialect: CapabilityGatedDialect::NAME,
                        option: "nickglob",
                    });
                }
                if raw.privilege.is_some() {
                    return Err(ConfigError::ConflictingShape {
                        dialect: CapabilityGatedDialect::NAME,
                        option: "privilege",
                    });
                }
                let require_oper = match raw.require_oper.as_deref() {
                    None => true,
                    Some(v) => parse_bool("require_oper", v)?,
                };
                Arc::new(CapabilityGatedDialect::new(
                    raw.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR),
                    require_oper,
                ))
            }
            PermissionGatedDialect::NAME => {
                if raw.separator.is_some() {
                    return Err(ConfigError::ConflictingShape {
                        dialect: PermissionGatedDialect::NAME,
                        option: "separator",
                    });
                }
                if raw.require_oper.is_some() {
                    return Err(ConfigError::ConflictingShape {
                        dialect: PermissionGatedDialect::NAME,
                        option: "require_oper",
                    });
                }
                Arc::new(PermissionGatedDialect::new(
                    raw.nickglob.as_deref().unwrap_or(DEFAULT_NICKGLOB),
                    raw.privilege.as_deref().unwrap_or(DEFAULT_PRIVILEGE),
                ))
            }
            _ => return Err(ConfigError::UnknownDialect(dialect_name)),
        };

        Self::new(
            dialect,
            raw.ident.as_deref().unwrap_or(DEFAULT_IDENT),
            raw.host.as_deref().unwrap_or(server_name),
        )
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn nick_shape(&self) -> &NickShape {
        self.dialect.nick_shape()
    }

    pub fn ident(&self) -> &str {
        &self.fake_ident
    }

    pub fn host(&self) -> &str {
        &self.fake_host
    }

    pub fn validator(&self) -> &NickValidator {
        &self.validator
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_owned(),
        }),
    }
}

/// Shared handle to the live configuration.
///
/// Readers take a cheap `Arc` snapshot and keep using it for the whole
/// request, so a concurrent reload is never observed half-way.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<RelayConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<RelayConfig> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    /// Validate `raw` into a fresh snapshot and swap it in.
    ///
    /// On failure the previous snapshot stays active.
    pub fn reload(
        &self,
        raw: &RawRelayConfig,
        server_name: &str,
    ) -> Result<Arc<RelayConfig>, ConfigError> {
        match RelayConfig::load(raw, server_name) {
            Ok(config) => {
                let config = Arc::new(config);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Arc::clone(&config);
                info!(
                    dialect = config.dialect().name(),
                    ident = config.ident(),
                    host = config.host(),
                    "relaymsg: configuration loaded"
                );
                Ok(config)
            }
            Err(e) => {
                warn!("relaymsg: configuration rejected, keeping previous: {e}");
                Err(e)
            }
        }
    }
}
