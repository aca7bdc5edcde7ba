//! Configuration handling for the SQL bridge.
//!
//! This module provides:
//! - [`ConnectionOptions`]: pool limits recognized by `open`
//! - [`TlsConfig`]: transport security settings handed to drivers
//! - [`parse_duration`]: the duration-string grammar used by options and timeouts
//! - [`Config`]: CLI arguments and environment variables for the binary

use crate::error::{DbError, DbResult};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of idle connections retained by a pool.
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 2;
/// Open-connection cap applied when the caller sets none ("unbounded").
///
/// sqlx sizes each pool's idle queue to its cap up front, so this stays a
/// few hundred rather than a truly huge number.
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 256;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Duration Strings
// =============================================================================

/// Parse a duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`.
///
/// The grammar is a possibly signed sequence of decimal numbers, each with an
/// optional fraction and a unit suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
/// A bare `"0"` is accepted. Negative durations clamp to zero, which callers
/// read as "already expired" for timeouts and "unbounded" for pool limits.
pub fn parse_duration(input: &str) -> DbResult<Duration> {
    let invalid = || DbError::invalid_option("duration", format!("invalid duration {:?}", input));

    let mut s = input;
    let mut negative = false;
    if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: u128 = 0;
    while !s.is_empty() {
        // integer part
        let int_len = s.bytes().take_while(u8::is_ascii_digit).count();
        let (int_digits, rest) = s.split_at(int_len);
        s = rest;

        // fractional part
        let mut frac_digits = "";
        if let Some(rest) = s.strip_prefix('.') {
            let frac_len = rest.bytes().take_while(u8::is_ascii_digit).count();
            (frac_digits, s) = rest.split_at(frac_len);
        }
        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(invalid());
        }

        let unit_len = s
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (unit, rest) = s.split_at(unit_len);
        s = rest;

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            "" => {
                return Err(DbError::invalid_option(
                    "duration",
                    format!("missing unit in duration {:?}", input),
                ));
            }
            _ => {
                return Err(DbError::invalid_option(
                    "duration",
                    format!("unknown unit {:?} in duration {:?}", unit, input),
                ));
            }
        };

        let whole: u128 = if int_digits.is_empty() {
            0
        } else {
            int_digits.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(unit_nanos).ok_or_else(invalid)?;

        if !frac_digits.is_empty() {
            // only the digits that can still matter at nanosecond precision
            let digits = &frac_digits[..frac_digits.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| invalid())?;
            let scale = 10u128.pow(digits.len() as u32);
            nanos += numerator * unit_nanos / scale;
        }

        total_nanos = total_nanos.checked_add(nanos).ok_or_else(invalid)?;
    }

    if total_nanos > u64::MAX as u128 {
        return Err(invalid());
    }
    if negative {
        return Ok(Duration::ZERO);
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    value
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

// =============================================================================
// Connection Options
// =============================================================================

/// Pool limits applied when a database handle is opened.
///
/// Every field is optional. Zero or omitted durations mean unbounded; zero or
/// omitted counts fall back to [`DEFAULT_MAX_IDLE_CONNS`] and "unbounded".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOptions {
    #[serde(
        default,
        alias = "connMaxIdleTime",
        deserialize_with = "deserialize_duration"
    )]
    pub conn_max_idle_time: Option<Duration>,
    #[serde(
        default,
        alias = "connMaxLifetime",
        deserialize_with = "deserialize_duration"
    )]
    pub conn_max_lifetime: Option<Duration>,
    #[serde(default, alias = "maxIdleConns")]
    pub max_idle_conns: Option<u32>,
    #[serde(default, alias = "maxOpenConns")]
    pub max_open_conns: Option<u32>,
    /// How long a call may wait for a pooled connection (default: 30s)
    #[serde(
        default,
        alias = "acquireTimeout",
        deserialize_with = "deserialize_duration"
    )]
    pub acquire_timeout: Option<Duration>,
}

impl ConnectionOptions {
    /// Parse options from a host-provided JSON object.
    pub fn from_json(value: serde_json::Value) -> DbResult<Self> {
        serde_json::from_value(value).map_err(|e| DbError::invalid_option("options", e.to_string()))
    }

    /// Idle timeout, `None` when unbounded.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.conn_max_idle_time.filter(|d| !d.is_zero())
    }

    /// Connection lifetime, `None` when unbounded.
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.conn_max_lifetime.filter(|d| !d.is_zero())
    }

    /// Configured open-connection cap, `None` when unbounded.
    pub fn max_open(&self) -> Option<u32> {
        self.max_open_conns.filter(|n| *n > 0)
    }

    /// Get max_open_conns, with [`DEFAULT_MAX_OPEN_CONNS`] standing in for unbounded.
    pub fn max_open_or_default(&self) -> u32 {
        self.max_open().unwrap_or(DEFAULT_MAX_OPEN_CONNS)
    }

    /// Idle connections to retain, never more than the open-connection cap.
    pub fn max_idle_or_default(&self) -> u32 {
        let idle = self
            .max_idle_conns
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_IDLE_CONNS);
        idle.min(self.max_open_or_default())
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        self.acquire_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
    }
}

// =============================================================================
// TLS
// =============================================================================

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLS_1_0", alias = "tls1.0")]
    Tls10,
    #[serde(rename = "TLS_1_1", alias = "tls1.1")]
    Tls11,
    #[default]
    #[serde(rename = "TLS_1_2", alias = "tls1.2")]
    Tls12,
    #[serde(rename = "TLS_1_3", alias = "tls1.3")]
    Tls13,
}

impl TlsVersion {
    /// All versions, oldest first.
    pub const ALL: [TlsVersion; 4] = [Self::Tls10, Self::Tls11, Self::Tls12, Self::Tls13];

    /// Constant name exposed to scripts.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tls10 => "TLS_1_0",
            Self::Tls11 => "TLS_1_1",
            Self::Tls12 => "TLS_1_2",
            Self::Tls13 => "TLS_1_3",
        }
    }

    /// Protocol version number as used on the wire (e.g. 0x0303 for TLS 1.2).
    pub fn wire_version(&self) -> u16 {
        match self {
            Self::Tls10 => 0x0301,
            Self::Tls11 => 0x0302,
            Self::Tls12 => 0x0303,
            Self::Tls13 => 0x0304,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport security settings consumed by drivers that support TLS.
///
/// Certificate files are only referenced by path; drivers load them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(alias = "enableTLS")]
    pub enable_tls: bool,
    #[serde(alias = "insecureSkipTLSverify")]
    pub insecure_skip_tls_verify: bool,
    #[serde(alias = "minVersion")]
    pub min_version: TlsVersion,
    #[serde(alias = "caCertFile")]
    pub ca_cert_file: Option<PathBuf>,
    #[serde(alias = "clientCertFile")]
    pub client_cert_file: Option<PathBuf>,
    #[serde(alias = "clientKeyFile")]
    pub client_key_file: Option<PathBuf>,
}

impl TlsConfig {
    /// Parse a TLS configuration from a host-provided JSON object.
    pub fn from_json(value: serde_json::Value) -> DbResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| DbError::invalid_option("tls", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A client certificate without its key (or vice versa) is rejected.
    pub fn validate(&self) -> DbResult<()> {
        match (&self.client_cert_file, &self.client_key_file) {
            (Some(_), None) => Err(DbError::invalid_option(
                "clientKeyFile",
                "client certificate given without a client key",
            )),
            (None, Some(_)) => Err(DbError::invalid_option(
                "clientCertFile",
                "client key given without a client certificate",
            )),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// CLI
// =============================================================================

/// Configuration for the `sql-bridge` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sql-bridge",
    about = "Run SQL statements through the driver-agnostic SQL bridge",
    version,
    author
)]
pub struct Config {
    /// Driver identity (sqlite3, postgres, mysql)
    #[arg(short = 'D', long, env = "SQL_BRIDGE_DRIVER")]
    pub driver: String,

    /// Driver-specific data source name (sensitive - not logged)
    #[arg(long, env = "SQL_BRIDGE_DSN")]
    pub dsn: String,

    /// Close idle connections after this long (e.g. "5m")
    #[arg(long, env = "SQL_BRIDGE_CONN_MAX_IDLE_TIME")]
    pub conn_max_idle_time: Option<String>,

    /// Recycle connections after this long (e.g. "1h")
    #[arg(long, env = "SQL_BRIDGE_CONN_MAX_LIFETIME")]
    pub conn_max_lifetime: Option<String>,

    /// Idle connections to retain (default: 2)
    #[arg(long, env = "SQL_BRIDGE_MAX_IDLE_CONNS")]
    pub max_idle_conns: Option<u32>,

    /// Maximum open connections (default: unbounded)
    #[arg(long, env = "SQL_BRIDGE_MAX_OPEN_CONNS")]
    pub max_open_conns: Option<u32>,

    /// Per-statement timeout (e.g. "30s")
    #[arg(short, long, env = "SQL_BRIDGE_TIMEOUT")]
    pub timeout: Option<String>,

    /// JSON file with TLS settings (enableTLS, caCertFile, ...)
    #[arg(long, env = "SQL_BRIDGE_TLS_CONFIG")]
    pub tls_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "SQL_BRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQL_BRIDGE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Statement to run.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a statement that returns no rows and print its summary
    Exec {
        statement: String,
        /// Positional arguments as JSON values (e.g. 42, "name-2", null)
        args: Vec<String>,
    },
    /// Run a query and print each row as a JSON line
    Query {
        statement: String,
        /// Positional arguments as JSON values (e.g. 42, "name-2", null)
        args: Vec<String>,
    },
}

impl Config {
    /// Build pool options from the CLI flags.
    pub fn connection_options(&self) -> DbResult<ConnectionOptions> {
        Ok(ConnectionOptions {
            conn_max_idle_time: self
                .conn_max_idle_time
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            conn_max_lifetime: self
                .conn_max_lifetime
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            acquire_timeout: None,
        })
    }

    /// Per-statement timeout, if one was given.
    pub fn statement_timeout(&self) -> DbResult<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}
