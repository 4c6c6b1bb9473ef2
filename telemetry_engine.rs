//! # Telemetry Engine - Metric Report Generation for BMC Telemetry
//!
//! Ingests streamed metric samples (sensor readings, firmware counters and the
//! like), keeps them in an embedded SQLite store, and materializes metric
//! reports according to user-declared Metric Report Definitions (MRDs).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           TELEMETRY REPORT ENGINE                           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLES → INSTANCE RESOLVER → AGGREGATION → CLOCK/SCHEDULER → GENERATOR    │
//! │                                   ↓                                  ↓      │
//! │                              SQLITE STORE  ←──────  MAINTENANCE RUNNER      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Data-driven clock**: the high-water mark of sample timestamps drives
//!   report scheduling, with a wall-clock tick to keep it moving
//! - **Report matrix**: Periodic, OnChange and OnRequest reports under
//!   Overwrite, NewReport and the two Append policies
//! - **Per-instance aggregation**: Average, Maximum, Minimum and Summation
//!   windows, duplicate suppression and gap interpolation
//! - **Single writer**: every mutation runs on one event loop inside an
//!   explicit transaction
//! - **Self-maintaining store**: retention trimming, orphan collection and
//!   compaction, one command per tick

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, SecondsFormat, Utc};

// ----------------------------------------------------------------------------
// Embedded Storage
// ----------------------------------------------------------------------------
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "telemetry-engine";
pub const ENGINE_FULL_NAME: &str = "Telemetry Report Engine";

/// Version recorded in the `SchemaVersion` table
pub const SCHEMA_VERSION: &str = "1.0.0";

// ----------------------------------------------------------------------------
// Report Defaults
// ----------------------------------------------------------------------------

/// Row limit applied by the Append* update policies
pub const DEFAULT_APPEND_LIMIT: u32 = 24_000;

/// Debounce between two OnChange generations of the same report
pub const SMALLEST_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the gap a single sample may backfill
pub const MAX_METRIC_EXPAND_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Wall clock vs. high-water mark divergence that is worth a warning
pub const MAX_ACCEPTABLE_DRIFT: Duration = Duration::from_secs(2);

/// Samples further than this from the high-water mark are logged
pub const MAX_METRIC_TIMESTAMP_DELTA: Duration = Duration::from_secs(60 * 60);

/// Number of generations kept for NewReport definitions
pub const NEW_REPORT_KEEP: usize = 3;

// ----------------------------------------------------------------------------
// Period & TimeSpan Bounds
// ----------------------------------------------------------------------------

pub const MIN_PERIOD: Duration = Duration::from_secs(5);
pub const MAX_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const MIN_TIME_SPAN: Duration = Duration::from_secs(60);
pub const MAX_TIME_SPAN: Duration = Duration::from_secs(4 * 60 * 60);

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Wall-clock tick that advances the report clock
pub const CLOCK_PERIOD: Duration = Duration::from_secs(1);

/// Maintenance timers. Coprime so they rarely land on the same tick.
pub const CLEAN_VALUES_INTERVAL: Duration = Duration::from_secs(307);
pub const VACUUM_INTERVAL: Duration = Duration::from_secs(3607);
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(10831);

/// Per-lane MetricValue row cap enforced by `clean values`
pub const DEFAULT_VALUE_CAP_PER_LANE: u64 = 500_000;

/// Event loop channel depth
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Broadcast channel depth for report notifications
pub const NOTIFICATION_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Resource URIs
// ----------------------------------------------------------------------------

pub const TELEMETRY_SERVICE_URI: &str = "/redfish/v1/TelemetryService";
pub const MRD_COLLECTION_URI: &str = "/redfish/v1/TelemetryService/MetricReportDefinitions";
pub const MR_COLLECTION_URI: &str = "/redfish/v1/TelemetryService/MetricReports";
pub const MD_COLLECTION_URI: &str = "/redfish/v1/TelemetryService/MetricDefinitions";
pub const TRIGGER_COLLECTION_URI: &str = "/redfish/v1/TelemetryService/Triggers";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch. `EPOCH` doubles as "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    #[inline]
    pub const fn is_epoch(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Signed distance `self - earlier` in nanoseconds
    #[inline]
    pub fn nanos_since(&self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Absolute distance between two timestamps
    pub fn abs_diff(&self, other: Timestamp) -> Duration {
        Duration::from_nanos(self.0.abs_diff(other.0))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// RFC 3339 rendering used in generated report names
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

/// Duration as signed nanoseconds, saturating at `i64::MAX`
#[inline]
pub fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Inverse of [`duration_nanos`]; negative values collapse to zero
#[inline]
pub fn nanos_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

// ----------------------------------------------------------------------------
// 3.2 Redfish Durations - ISO 8601 "P#DT#H#M#S"
// ----------------------------------------------------------------------------

fn redfish_duration_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(-?)P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$").ok()
        })
        .as_ref()
}

/// Ceiling for parsed durations; anything longer saturates here
pub const MAX_REDFISH_DURATION: Duration = Duration::from_nanos(i64::MAX as u64);

/// Parse a Redfish duration. Negative durations clamp to zero and overlong
/// ones to [`MAX_REDFISH_DURATION`].
pub fn parse_redfish_duration(text: &str) -> TelemetryResult<Duration> {
    let invalid = || TelemetryError::InvalidRequest(format!("invalid Redfish duration '{}'", text));
    let pattern = redfish_duration_regex()
        .ok_or_else(|| TelemetryError::Internal("duration pattern failed to compile".into()))?;
    let caps = pattern.captures(text.trim()).ok_or_else(invalid)?;

    let whole = |idx: usize| -> TelemetryResult<u64> {
        caps.get(idx)
            .map(|m| m.as_str().parse::<u64>().map_err(|_| invalid()))
            .unwrap_or(Ok(0))
    };
    let days = whole(2)?;
    let hours = whole(3)?;
    let minutes = whole(4)?;
    let seconds = caps
        .get(5)
        .map(|m| m.as_str().parse::<f64>().map_err(|_| invalid()))
        .unwrap_or(Ok(0.0))?;

    if &caps[1] == "-" {
        return Ok(Duration::ZERO);
    }

    let whole_secs = days
        .checked_mul(86_400)
        .zip(hours.checked_mul(3_600))
        .and_then(|(d, h)| d.checked_add(h))
        .zip(minutes.checked_mul(60))
        .and_then(|(dh, m)| dh.checked_add(m));
    let total = whole_secs
        .zip(Duration::try_from_secs_f64(seconds).ok())
        .and_then(|(whole, frac)| Duration::from_secs(whole).checked_add(frac));
    Ok(total.map_or(MAX_REDFISH_DURATION, |d| d.min(MAX_REDFISH_DURATION)))
}

/// Render as `PT<seconds>S`
pub fn format_redfish_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("PT{}S", duration.as_secs())
    } else {
        format!("PT{}S", duration.as_secs_f64())
    }
}

/// Serde adapter for Redfish durations. Bare integers are read as seconds.
pub mod redfish_duration {
    use super::{format_redfish_duration, parse_redfish_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_redfish_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs).min(super::MAX_REDFISH_DURATION)),
            Raw::Text(text) if text.is_empty() => Ok(Duration::ZERO),
            Raw::Text(text) => parse_redfish_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Report Type & Update Policy
// ----------------------------------------------------------------------------

/// `MetricReportDefinitionType`. Unknown strings land on `Unrecognized` and are
/// normalized by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReportType {
    Periodic,
    OnChange,
    OnRequest,
    #[default]
    #[serde(other)]
    Unrecognized,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Periodic => "Periodic",
            ReportType::OnChange => "OnChange",
            ReportType::OnRequest => "OnRequest",
            ReportType::Unrecognized => "Unrecognized",
        }
    }

    pub fn from_db(text: &str) -> Self {
        match text {
            "Periodic" => ReportType::Periodic,
            "OnChange" => ReportType::OnChange,
            "OnRequest" => ReportType::OnRequest,
            _ => ReportType::Unrecognized,
        }
    }
}

impl Display for ReportType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ReportUpdates` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReportUpdates {
    #[default]
    Overwrite,
    NewReport,
    AppendStopsWhenFull,
    AppendWrapsWhenFull,
    #[serde(other)]
    Unrecognized,
}

impl ReportUpdates {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportUpdates::Overwrite => "Overwrite",
            ReportUpdates::NewReport => "NewReport",
            ReportUpdates::AppendStopsWhenFull => "AppendStopsWhenFull",
            ReportUpdates::AppendWrapsWhenFull => "AppendWrapsWhenFull",
            ReportUpdates::Unrecognized => "Unrecognized",
        }
    }

    pub fn from_db(text: &str) -> Self {
        match text {
            "Overwrite" => ReportUpdates::Overwrite,
            "NewReport" => ReportUpdates::NewReport,
            "AppendStopsWhenFull" => ReportUpdates::AppendStopsWhenFull,
            "AppendWrapsWhenFull" => ReportUpdates::AppendWrapsWhenFull,
            _ => ReportUpdates::Unrecognized,
        }
    }

    #[inline]
    pub fn is_append(&self) -> bool {
        matches!(self, ReportUpdates::AppendStopsWhenFull | ReportUpdates::AppendWrapsWhenFull)
    }
}

impl Display for ReportUpdates {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Collection Functions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionFunction {
    Average,
    Maximum,
    Minimum,
    Summation,
}

impl CollectionFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionFunction::Average => "Average",
            CollectionFunction::Maximum => "Maximum",
            CollectionFunction::Minimum => "Minimum",
            CollectionFunction::Summation => "Summation",
        }
    }

    /// Empty or unknown names mean "no aggregation"
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Average" => Some(CollectionFunction::Average),
            "Maximum" => Some(CollectionFunction::Maximum),
            "Minimum" => Some(CollectionFunction::Minimum),
            "Summation" => Some(CollectionFunction::Summation),
            _ => None,
        }
    }
}

impl Display for CollectionFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn deserialize_collection_function<'de, D>(deserializer: D) -> Result<Option<CollectionFunction>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(CollectionFunction::parse))
}

// ----------------------------------------------------------------------------
// 3.5 Metric Samples - The Ingested Unit
// ----------------------------------------------------------------------------

/// One metric reading as delivered by upstream acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub context: String,
    #[serde(rename = "FQDD", default)]
    pub fqdd: String,
    #[serde(rename = "FriendlyFQDD", default)]
    pub friendly_fqdd: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "MVRequiresExpand", default)]
    pub requires_expand: bool,
    #[serde(rename = "MVSensorInterval", default, with = "redfish_duration")]
    pub sensor_interval: Duration,
    #[serde(rename = "MVSensorSlack", default, with = "redfish_duration")]
    pub sensor_slack: Duration,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            name: name.into(),
            value: value.into(),
            property: String::new(),
            context: String::new(),
            fqdd: String::new(),
            friendly_fqdd: String::new(),
            source: String::new(),
            requires_expand: false,
            sensor_interval: Duration::ZERO,
            sensor_slack: Duration::ZERO,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = property.into();
        self
    }

    pub fn with_fqdd(mut self, fqdd: impl Into<String>) -> Self {
        self.fqdd = fqdd.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Mark the stream as sampled every `interval`, tolerating `slack` jitter
    pub fn with_expansion(mut self, interval: Duration, slack: Duration) -> Self {
        self.requires_expand = true;
        self.sensor_interval = interval;
        self.sensor_slack = slack;
        self
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// Resource families named in not-found / conflict errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ReportDefinition,
    Report,
    MetricDefinition,
    Trigger,
    Document,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ReportDefinition => "MetricReportDefinition",
            ResourceKind::Report => "MetricReport",
            ResourceKind::MetricDefinition => "MetricDefinition",
            ResourceKind::Trigger => "Trigger",
            ResourceKind::Document => "Document",
        };
        f.write_str(name)
    }
}

/// The main error type for the telemetry engine.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A scheduled report produced no rows; its transaction was rolled back.
    #[error("Nothing to report for {name}")]
    EmptyReport { name: String },

    /// Commit or rollback failed; the store state can no longer be trusted.
    #[error("Unrecoverable storage failure: {0}")]
    Unrecoverable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl TelemetryError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        TelemetryError::NotFound { kind, name: name.into() }
    }

    pub fn already_exists(kind: ResourceKind, name: impl Into<String>) -> Self {
        TelemetryError::AlreadyExists { kind, name: name.into() }
    }

    /// Check if the engine may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            TelemetryError::Config(_) => false,
            TelemetryError::Storage(_) => true,
            TelemetryError::NotFound { .. } => true,
            TelemetryError::AlreadyExists { .. } => true,
            TelemetryError::InvalidPayload(_) => true,
            TelemetryError::InvalidRequest(_) => true,
            TelemetryError::EmptyReport { .. } => true,
            TelemetryError::Unrecoverable(_) => false,
            TelemetryError::Io(_) => true,
            TelemetryError::Internal(_) => false,
            TelemetryError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    /// Failures an operator must see: storage trouble and anything fatal.
    /// Rejected requests are the caller's problem.
    pub fn is_critical(&self) -> bool {
        matches!(self, TelemetryError::Storage(_) | TelemetryError::Io(_)) || !self.is_recoverable()
    }

    pub fn category(&self) -> &'static str {
        match self {
            TelemetryError::Config(_) => "config",
            TelemetryError::Storage(_) => "storage",
            TelemetryError::NotFound { .. } => "not_found",
            TelemetryError::AlreadyExists { .. } => "conflict",
            TelemetryError::InvalidPayload(_) => "payload",
            TelemetryError::InvalidRequest(_) => "request",
            TelemetryError::EmptyReport { .. } => "empty_report",
            TelemetryError::Unrecoverable(_) => "unrecoverable",
            TelemetryError::Io(_) => "io",
            TelemetryError::Internal(_) => "internal",
            TelemetryError::ShuttingDown => "shutdown",
        }
    }
}

/// UNIQUE / FOREIGN KEY / CHECK failures surface as `ConstraintViolation`
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file, TELEMETRY_-prefixed environment overrides, validation and
// sensible defaults. Durations are written the humantime way ("5s", "1h").
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the telemetry engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Process-level engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Report generation tunables
    #[serde(default)]
    pub reports: ReportSettings,

    /// Period/TimeSpan clamping bounds
    #[serde(default)]
    pub limits: ReportLimits,

    /// Storage maintenance schedule and op lists
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TELEMETRY_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn parse_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.clock_period.is_zero() {
            return Err(ConfigError::invalid_value(
                "engine.clock_period",
                "clock period must be non-zero",
            ));
        }

        if self.engine.event_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "engine.event_queue_capacity",
                "event queue needs room for at least one event",
            ));
        }

        if self.reports.append_limit == 0 {
            return Err(ConfigError::invalid_value(
                "reports.append_limit",
                "append limit must be at least 1",
            ));
        }

        if self.reports.new_report_keep == 0 {
            return Err(ConfigError::invalid_value(
                "reports.new_report_keep",
                "at least one NewReport generation must be kept",
            ));
        }

        let limits = &self.limits;
        if limits.min_period.is_zero() || limits.min_period > limits.max_period {
            return Err(ConfigError::invalid_value(
                "limits.min_period",
                format!(
                    "expected 0 < min_period <= max_period ({})",
                    humantime::format_duration(limits.max_period)
                ),
            ));
        }

        if limits.default_period < limits.min_period || limits.default_period > limits.max_period {
            return Err(ConfigError::invalid_value(
                "limits.default_period",
                "default period must lie within [min_period, max_period]",
            ));
        }

        if limits.min_time_span > limits.max_time_span {
            return Err(ConfigError::invalid_value(
                "limits.min_time_span",
                "min_time_span cannot exceed max_time_span",
            ));
        }

        let maintenance = &self.maintenance;
        for (field, value) in [
            ("maintenance.clean_values_interval", maintenance.clean_values_interval),
            ("maintenance.vacuum_interval", maintenance.vacuum_interval),
            ("maintenance.optimize_interval", maintenance.optimize_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid_value(field, "interval must be non-zero"));
            }
        }

        if maintenance.value_cap_per_lane == 0 {
            return Err(ConfigError::invalid_value(
                "maintenance.value_cap_per_lane",
                "per-lane cap must be at least 1",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Engine Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Wall-clock tick driving the report clock
    #[serde(default = "default_clock_period", with = "humantime_serde")]
    pub clock_period: Duration,

    /// Graceful shutdown timeout
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Depth of the event loop channel
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            clock_period: default_clock_period(),
            shutdown_timeout: default_shutdown_timeout(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("telemetry.db")
}

fn default_clock_period() -> Duration {
    CLOCK_PERIOD
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_event_queue_capacity() -> usize {
    EVENT_QUEUE_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.3 Report Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    /// AppendLimit given to definitions that do not set one
    #[serde(default = "default_append_limit")]
    pub append_limit: u32,

    /// OnChange debounce
    #[serde(default = "default_smallest_report_interval", with = "humantime_serde")]
    pub smallest_report_interval: Duration,

    /// Cap on gap backfill per sample
    #[serde(default = "default_max_expand_interval", with = "humantime_serde")]
    pub max_metric_expand_interval: Duration,

    /// Wall clock vs. high-water mark divergence that triggers a warning
    #[serde(default = "default_max_acceptable_drift", with = "humantime_serde")]
    pub max_acceptable_drift: Duration,

    /// Sample timestamps further than this from the high-water mark are logged
    #[serde(default = "default_max_timestamp_delta", with = "humantime_serde")]
    pub max_metric_timestamp_delta: Duration,

    /// Reset the high-water mark to wall clock when drift exceeds the limit
    #[serde(default)]
    pub correct_drift: bool,

    /// Generations kept under NewReport
    #[serde(default = "default_new_report_keep")]
    pub new_report_keep: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            append_limit: default_append_limit(),
            smallest_report_interval: default_smallest_report_interval(),
            max_metric_expand_interval: default_max_expand_interval(),
            max_acceptable_drift: default_max_acceptable_drift(),
            max_metric_timestamp_delta: default_max_timestamp_delta(),
            correct_drift: false,
            new_report_keep: default_new_report_keep(),
        }
    }
}

fn default_append_limit() -> u32 {
    DEFAULT_APPEND_LIMIT
}

fn default_smallest_report_interval() -> Duration {
    SMALLEST_REPORT_INTERVAL
}

fn default_max_expand_interval() -> Duration {
    MAX_METRIC_EXPAND_INTERVAL
}

fn default_max_acceptable_drift() -> Duration {
    MAX_ACCEPTABLE_DRIFT
}

fn default_max_timestamp_delta() -> Duration {
    MAX_METRIC_TIMESTAMP_DELTA
}

fn default_new_report_keep() -> usize {
    NEW_REPORT_KEEP
}

// ----------------------------------------------------------------------------
// 5.4 Period & TimeSpan Limits
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLimits {
    #[serde(default = "default_min_period", with = "humantime_serde")]
    pub min_period: Duration,

    #[serde(default = "default_max_period", with = "humantime_serde")]
    pub max_period: Duration,

    #[serde(default = "default_period", with = "humantime_serde")]
    pub default_period: Duration,

    #[serde(default = "default_min_time_span", with = "humantime_serde")]
    pub min_time_span: Duration,

    #[serde(default = "default_max_time_span", with = "humantime_serde")]
    pub max_time_span: Duration,
}

impl Default for ReportLimits {
    fn default() -> Self {
        Self {
            min_period: default_min_period(),
            max_period: default_max_period(),
            default_period: default_period(),
            min_time_span: default_min_time_span(),
            max_time_span: default_max_time_span(),
        }
    }
}

fn default_min_period() -> Duration {
    MIN_PERIOD
}

fn default_max_period() -> Duration {
    MAX_PERIOD
}

fn default_period() -> Duration {
    DEFAULT_PERIOD
}

fn default_min_time_span() -> Duration {
    MIN_TIME_SPAN
}

fn default_max_time_span() -> Duration {
    MAX_TIME_SPAN
}

// ----------------------------------------------------------------------------
// 5.5 Maintenance Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Timer that queues `clean values`
    #[serde(default = "default_clean_values_interval", with = "humantime_serde")]
    pub clean_values_interval: Duration,

    /// Timer that queues `vacuum`
    #[serde(default = "default_vacuum_interval", with = "humantime_serde")]
    pub vacuum_interval: Duration,

    /// Timer that queues `optimize` and `delete orphans`
    #[serde(default = "default_optimize_interval", with = "humantime_serde")]
    pub optimize_interval: Duration,

    /// Rows kept per MetricValue lane
    #[serde(default = "default_value_cap_per_lane")]
    pub value_cap_per_lane: u64,

    #[serde(default = "default_clean_values_ops")]
    pub clean_values_ops: Vec<MaintenanceOp>,

    #[serde(default = "default_delete_orphans_ops")]
    pub delete_orphans_ops: Vec<MaintenanceOp>,

    #[serde(default = "default_optimize_ops")]
    pub optimize_ops: Vec<MaintenanceOp>,

    #[serde(default = "default_vacuum_ops")]
    pub vacuum_ops: Vec<MaintenanceOp>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            clean_values_interval: default_clean_values_interval(),
            vacuum_interval: default_vacuum_interval(),
            optimize_interval: default_optimize_interval(),
            value_cap_per_lane: default_value_cap_per_lane(),
            clean_values_ops: default_clean_values_ops(),
            delete_orphans_ops: default_delete_orphans_ops(),
            optimize_ops: default_optimize_ops(),
            vacuum_ops: default_vacuum_ops(),
        }
    }
}

impl MaintenanceConfig {
    /// Ordered op list behind a maintenance command
    pub fn ops_for(&self, command: MaintenanceCommand) -> &[MaintenanceOp] {
        match command {
            MaintenanceCommand::CleanValues => &self.clean_values_ops,
            MaintenanceCommand::DeleteOrphans => &self.delete_orphans_ops,
            MaintenanceCommand::Optimize => &self.optimize_ops,
            MaintenanceCommand::Vacuum => &self.vacuum_ops,
        }
    }
}

fn default_clean_values_interval() -> Duration {
    CLEAN_VALUES_INTERVAL
}

fn default_vacuum_interval() -> Duration {
    VACUUM_INTERVAL
}

fn default_optimize_interval() -> Duration {
    OPTIMIZE_INTERVAL
}

fn default_value_cap_per_lane() -> u64 {
    DEFAULT_VALUE_CAP_PER_LANE
}

fn default_clean_values_ops() -> Vec<MaintenanceOp> {
    vec![
        MaintenanceOp::DeleteSurplusReports,
        MaintenanceOp::TrimIntValues,
        MaintenanceOp::TrimRealValues,
        MaintenanceOp::TrimTextValues,
        MaintenanceOp::DeleteOrphanValues,
        MaintenanceOp::Shrink,
    ]
}

fn default_delete_orphans_ops() -> Vec<MaintenanceOp> {
    vec![
        MaintenanceOp::DeleteOrphanMeta,
        MaintenanceOp::DeleteOrphanInstances,
        MaintenanceOp::DeleteOrphanAssociations,
        MaintenanceOp::DeleteOrphanValues,
    ]
}

fn default_optimize_ops() -> Vec<MaintenanceOp> {
    vec![MaintenanceOp::Optimize, MaintenanceOp::Shrink]
}

fn default_vacuum_ops() -> Vec<MaintenanceOp> {
    vec![MaintenanceOp::Vacuum, MaintenanceOp::Shrink]
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the global subscriber based on configuration
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                subscriber_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "compact" => registry
            .with(
                subscriber_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                subscriber_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "telemetry::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: STORAGE LAYER
// ============================================================================
// One SQLite connection, one writer. The schema is a fixed, versioned set of
// tables and views; every statement the engine runs is a const below.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Schema
// ----------------------------------------------------------------------------

const STORAGE_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS SchemaVersion (
    Version TEXT NOT NULL,
    AppliedAt TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS MetricReportDefinition (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    Name TEXT NOT NULL UNIQUE,
    ShortDesc TEXT NOT NULL DEFAULT '',
    LongDesc TEXT NOT NULL DEFAULT '',
    Type TEXT NOT NULL,
    Updates TEXT NOT NULL,
    Actions TEXT NOT NULL DEFAULT '[]',
    Wildcards TEXT NOT NULL DEFAULT '[]',
    Metrics TEXT NOT NULL DEFAULT '[]',
    SuppressDups INTEGER NOT NULL DEFAULT 0,
    Enabled INTEGER NOT NULL DEFAULT 0,
    Period INTEGER NOT NULL DEFAULT 0,
    TimeSpan INTEGER NOT NULL DEFAULT 0,
    HeartbeatInterval INTEGER NOT NULL DEFAULT 0,
    AppendLimit INTEGER NOT NULL DEFAULT 24000,
    Hidden INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS MetricMeta (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    NamePattern TEXT NOT NULL,
    FQDDPattern TEXT NOT NULL DEFAULT '',
    SourcePattern TEXT NOT NULL DEFAULT '',
    PropertyPattern TEXT NOT NULL DEFAULT '',
    Wildcards TEXT NOT NULL DEFAULT '{}',
    CollectionFunction TEXT NOT NULL DEFAULT '',
    CollectionDuration INTEGER NOT NULL DEFAULT 0,
    SuppressDups INTEGER NOT NULL DEFAULT 0,
    UNIQUE (NamePattern, FQDDPattern, SourcePattern, PropertyPattern, Wildcards,
            CollectionFunction, CollectionDuration, SuppressDups)
);

CREATE TABLE IF NOT EXISTS ReportDefinitionToMetricMeta (
    ReportDefID INTEGER NOT NULL REFERENCES MetricReportDefinition(ID) ON DELETE CASCADE,
    MetricMetaID INTEGER NOT NULL REFERENCES MetricMeta(ID) ON DELETE CASCADE,
    PRIMARY KEY (ReportDefID, MetricMetaID)
);
CREATE INDEX IF NOT EXISTS ReportDefinitionToMetricMeta_Meta
    ON ReportDefinitionToMetricMeta(MetricMetaID);

CREATE TABLE IF NOT EXISTS MetricInstance (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    MetaID INTEGER NOT NULL,
    Name TEXT NOT NULL,
    Property TEXT NOT NULL DEFAULT '',
    Context TEXT NOT NULL DEFAULT '',
    FQDD TEXT NOT NULL DEFAULT '',
    Source TEXT NOT NULL DEFAULT '',
    Label TEXT NOT NULL,
    CollectionScratch TEXT NOT NULL DEFAULT '{}',
    FlushTime INTEGER NOT NULL DEFAULT 0,
    LastTS INTEGER NOT NULL DEFAULT 0,
    LastValue TEXT NOT NULL DEFAULT '',
    MISensorInterval INTEGER NOT NULL DEFAULT 0,
    MISensorSlack INTEGER NOT NULL DEFAULT 0,
    MIRequiresExpand INTEGER NOT NULL DEFAULT 0,
    Dirty INTEGER NOT NULL DEFAULT 0,
    UNIQUE (MetaID, Name, Property, Context, Label)
);
CREATE INDEX IF NOT EXISTS MetricInstance_Stream ON MetricInstance(Name, Property, Context);

CREATE TABLE IF NOT EXISTS MetricMetaInstance (
    MetaID INTEGER NOT NULL,
    InstanceID INTEGER NOT NULL,
    PRIMARY KEY (MetaID, InstanceID)
);

CREATE TABLE IF NOT EXISTS MetricValueInt (
    InstanceID INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Value INTEGER NOT NULL,
    PRIMARY KEY (InstanceID, Timestamp)
);
CREATE INDEX IF NOT EXISTS MetricValueInt_Timestamp ON MetricValueInt(Timestamp);

CREATE TABLE IF NOT EXISTS MetricValueReal (
    InstanceID INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Value REAL NOT NULL,
    PRIMARY KEY (InstanceID, Timestamp)
);
CREATE INDEX IF NOT EXISTS MetricValueReal_Timestamp ON MetricValueReal(Timestamp);

CREATE TABLE IF NOT EXISTS MetricValueText (
    InstanceID INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Value TEXT NOT NULL,
    PRIMARY KEY (InstanceID, Timestamp)
);
CREATE INDEX IF NOT EXISTS MetricValueText_Timestamp ON MetricValueText(Timestamp);

CREATE TABLE IF NOT EXISTS MetricReport (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    Name TEXT NOT NULL UNIQUE,
    ReportDefinitionID INTEGER NOT NULL REFERENCES MetricReportDefinition(ID) ON DELETE CASCADE,
    Sequence INTEGER NOT NULL DEFAULT 0,
    ReportTimestamp INTEGER NOT NULL,
    StartTimestamp INTEGER NOT NULL,
    EndTimestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS MetricReport_Definition ON MetricReport(ReportDefinitionID);

CREATE TABLE IF NOT EXISTS MetricDefinition (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    MetricID TEXT NOT NULL UNIQUE,
    Name TEXT NOT NULL DEFAULT '',
    Description TEXT NOT NULL DEFAULT '',
    MetricType TEXT NOT NULL DEFAULT '',
    MetricDataType TEXT NOT NULL DEFAULT '',
    Units TEXT NOT NULL DEFAULT '',
    Accuracy REAL NOT NULL DEFAULT 0,
    SensingInterval TEXT NOT NULL DEFAULT '',
    DiscreteValues TEXT NOT NULL DEFAULT '[]',
    FQDDPattern TEXT NOT NULL DEFAULT '',
    SourcePattern TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS TriggerDefinition (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    Name TEXT NOT NULL UNIQUE,
    Body TEXT NOT NULL
);

CREATE VIEW IF NOT EXISTS MetricValue AS
    SELECT InstanceID, Timestamp, CAST(Value AS TEXT) AS Value FROM MetricValueInt
    UNION ALL
    SELECT InstanceID, Timestamp, CAST(Value AS TEXT) AS Value FROM MetricValueReal
    UNION ALL
    SELECT InstanceID, Timestamp, Value FROM MetricValueText;

CREATE VIEW IF NOT EXISTS MetricValueByReportWindow AS
    SELECT
        MR.ID AS ReportID,
        MR.Name AS ReportName,
        MRD.ID AS ReportDefID,
        MI.ID AS InstanceID,
        MI.Name AS MetricName,
        MI.Property AS Property,
        MI.Context AS Context,
        MI.FQDD AS FQDD,
        MI.Label AS Label,
        MV.Timestamp AS Timestamp,
        MV.Value AS Value,
        ROW_NUMBER() OVER (PARTITION BY MR.ID ORDER BY MV.Timestamp ASC, MI.ID ASC) AS OldestRank,
        ROW_NUMBER() OVER (PARTITION BY MR.ID ORDER BY MV.Timestamp DESC, MI.ID DESC) AS NewestRank
    FROM MetricReport MR
    JOIN MetricReportDefinition MRD ON MRD.ID = MR.ReportDefinitionID
    JOIN ReportDefinitionToMetricMeta RDM ON RDM.ReportDefID = MRD.ID
    JOIN MetricMetaInstance MMI ON MMI.MetaID = RDM.MetricMetaID
    JOIN MetricInstance MI ON MI.ID = MMI.InstanceID
    JOIN MetricValue MV ON MV.InstanceID = MI.ID
    WHERE MV.Timestamp <= MR.EndTimestamp
      AND MV.Timestamp >= MAX(
            MR.StartTimestamp,
            CASE WHEN MRD.TimeSpan > 0 THEN MR.EndTimestamp - MRD.TimeSpan ELSE MR.StartTimestamp END);

-- Append truncation is a read-time projection: StopsWhenFull keeps the oldest
-- AppendLimit rows, WrapsWhenFull keeps the newest.
CREATE VIEW IF NOT EXISTS MetricValueByReport AS
    SELECT W.*
    FROM MetricValueByReportWindow W
    JOIN MetricReportDefinition MRD ON MRD.ID = W.ReportDefID
    WHERE CASE MRD.Updates
        WHEN 'AppendStopsWhenFull' THEN W.OldestRank <= MRD.AppendLimit
        WHEN 'AppendWrapsWhenFull' THEN W.NewestRank <= MRD.AppendLimit
        ELSE 1
    END;

CREATE VIEW IF NOT EXISTS MetricReportJson AS
    SELECT
        '/redfish/v1/TelemetryService/MetricReports/' || MR.Name AS URI,
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricReports/' || MR.Name,
            '@odata.type', '#MetricReport.v1_4_2.MetricReport',
            'Id', MR.Name,
            'Name', MR.Name || ' Metric Report',
            'ReportSequence', MR.Sequence,
            'Timestamp', strftime('%Y-%m-%dT%H:%M:%fZ', MR.ReportTimestamp / 1e9, 'unixepoch'),
            'StartTimestamp', strftime('%Y-%m-%dT%H:%M:%fZ', MR.StartTimestamp / 1e9, 'unixepoch'),
            'EndTimestamp', strftime('%Y-%m-%dT%H:%M:%fZ', MR.EndTimestamp / 1e9, 'unixepoch'),
            'MetricReportDefinition', json_object(
                '@odata.id', '/redfish/v1/TelemetryService/MetricReportDefinitions/' || MRD.Name),
            'MetricValues', json((
                SELECT json_group_array(json_object(
                    'MetricId', V.MetricName,
                    'MetricProperty', V.Property,
                    'MetricValue', V.Value,
                    'Timestamp', strftime('%Y-%m-%dT%H:%M:%fZ', V.Timestamp / 1e9, 'unixepoch'),
                    'Oem', json_object('Dell', json_object(
                        'Context', V.Context, 'Label', V.Label, 'FQDD', V.FQDD))))
                FROM (SELECT * FROM MetricValueByReport
                      WHERE ReportID = MR.ID
                      ORDER BY Timestamp ASC, InstanceID ASC) V)),
            'MetricValues@odata.count', (
                SELECT COUNT(*) FROM MetricValueByReport WHERE ReportID = MR.ID)
        ) AS Body
    FROM MetricReport MR
    JOIN MetricReportDefinition MRD ON MRD.ID = MR.ReportDefinitionID;

CREATE VIEW IF NOT EXISTS MetricReportDefinitionJson AS
    SELECT
        '/redfish/v1/TelemetryService/MetricReportDefinitions/' || Name AS URI,
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricReportDefinitions/' || Name,
            '@odata.type', '#MetricReportDefinition.v1_3_0.MetricReportDefinition',
            'Id', Name,
            'Name', ShortDesc,
            'Description', LongDesc,
            'MetricReportDefinitionType', Type,
            'ReportUpdates', Updates,
            'ReportActions', json(Actions),
            'Wildcards', json(Wildcards),
            'MetricReportDefinitionEnabled', json(CASE WHEN Enabled THEN 'true' ELSE 'false' END),
            'SuppressRepeatedMetricValue', json(CASE WHEN SuppressDups THEN 'true' ELSE 'false' END),
            'AppendLimit', AppendLimit,
            'Schedule', json_object('RecurrenceInterval', 'PT' || (Period / 1000000000) || 'S'),
            'ReportTimespan', 'PT' || (TimeSpan / 1000000000) || 'S',
            'MetricReportHeartbeatInterval', 'PT' || (HeartbeatInterval / 1000000000) || 'S',
            'Metrics', json(Metrics),
            'MetricReport', json_object(
                '@odata.id', '/redfish/v1/TelemetryService/MetricReports/' || Name)
        ) AS Body
    FROM MetricReportDefinition
    WHERE Hidden = 0;

CREATE VIEW IF NOT EXISTS MetricDefinitionJson AS
    SELECT
        '/redfish/v1/TelemetryService/MetricDefinitions/' || MetricID AS URI,
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricDefinitions/' || MetricID,
            '@odata.type', '#MetricDefinition.v1_0_3.MetricDefinition',
            'Id', MetricID,
            'Name', Name,
            'Description', Description,
            'MetricType', MetricType,
            'MetricDataType', MetricDataType,
            'Units', Units,
            'Accuracy', Accuracy,
            'SensingInterval', SensingInterval,
            'DiscreteValues', json(DiscreteValues),
            'Oem', json_object('Dell', json_object('FQDD', FQDDPattern, 'Source', SourcePattern))
        ) AS Body
    FROM MetricDefinition;

CREATE VIEW IF NOT EXISTS TriggerJson AS
    SELECT
        '/redfish/v1/TelemetryService/Triggers/' || Name AS URI,
        json_set(Body, '$.\"@odata.id\"', '/redfish/v1/TelemetryService/Triggers/' || Name) AS Body
    FROM TriggerDefinition;

CREATE VIEW IF NOT EXISTS CollectionJson AS
    SELECT
        '/redfish/v1/TelemetryService/MetricReportDefinitions' AS URI,
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricReportDefinitions',
            'Name', 'Metric Report Definitions',
            'Members', json((SELECT json_group_array(json_object(
                '@odata.id', '/redfish/v1/TelemetryService/MetricReportDefinitions/' || Name))
                FROM (SELECT Name FROM MetricReportDefinition WHERE Hidden = 0 ORDER BY Name))),
            'Members@odata.count', (SELECT COUNT(*) FROM MetricReportDefinition WHERE Hidden = 0)
        ) AS Body
    UNION ALL
    SELECT
        '/redfish/v1/TelemetryService/MetricReports',
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricReports',
            'Name', 'Metric Reports',
            'Members', json((SELECT json_group_array(json_object(
                '@odata.id', '/redfish/v1/TelemetryService/MetricReports/' || Name))
                FROM (SELECT Name FROM MetricReport ORDER BY Name))),
            'Members@odata.count', (SELECT COUNT(*) FROM MetricReport)
        )
    UNION ALL
    SELECT
        '/redfish/v1/TelemetryService/MetricDefinitions',
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/MetricDefinitions',
            'Name', 'Metric Definitions',
            'Members', json((SELECT json_group_array(json_object(
                '@odata.id', '/redfish/v1/TelemetryService/MetricDefinitions/' || MetricID))
                FROM (SELECT MetricID FROM MetricDefinition ORDER BY MetricID))),
            'Members@odata.count', (SELECT COUNT(*) FROM MetricDefinition)
        )
    UNION ALL
    SELECT
        '/redfish/v1/TelemetryService/Triggers',
        json_object(
            '@odata.id', '/redfish/v1/TelemetryService/Triggers',
            'Name', 'Triggers',
            'Members', json((SELECT json_group_array(json_object(
                '@odata.id', '/redfish/v1/TelemetryService/Triggers/' || Name))
                FROM (SELECT Name FROM TriggerDefinition ORDER BY Name))),
            'Members@odata.count', (SELECT COUNT(*) FROM TriggerDefinition)
        );

CREATE VIEW IF NOT EXISTS GenericGet AS
    SELECT URI, Body FROM MetricReportJson
    UNION ALL SELECT URI, Body FROM MetricReportDefinitionJson
    UNION ALL SELECT URI, Body FROM MetricDefinitionJson
    UNION ALL SELECT URI, Body FROM TriggerJson
    UNION ALL SELECT URI, Body FROM CollectionJson;
";

// ----------------------------------------------------------------------------
// 7.2 Database Handle - The Single Writer
// ----------------------------------------------------------------------------

/// Owner of the one writer connection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a file-backed store
    pub fn open<P: AsRef<Path>>(path: P) -> TelemetryResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        info!(target: "telemetry::storage", path = %path.display(), "Database opened");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory store
    pub fn open_in_memory() -> TelemetryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn init_schema(conn: &Connection) -> TelemetryResult<()> {
        conn.execute_batch(STORAGE_PRAGMAS)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM SchemaVersion", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute("INSERT INTO SchemaVersion (Version) VALUES (?1)", [SCHEMA_VERSION])?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read-only access outside a transaction
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside an IMMEDIATE transaction. Errors from `f` roll back; a
    /// failed commit or rollback is unrecoverable.
    pub fn with_transaction<T, F>(&mut self, f: F) -> TelemetryResult<T>
    where
        F: FnOnce(&Connection) -> TelemetryResult<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| TelemetryError::Unrecoverable(format!("commit failed: {}", e)))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    error!(
                        target: "telemetry::storage",
                        error = %rollback,
                        cause = %err,
                        "Rollback failed"
                    );
                    return Err(TelemetryError::Unrecoverable(format!("rollback failed: {}", rollback)));
                }
                Err(err)
            }
        }
    }

    /// Statements that SQLite refuses inside a transaction (VACUUM)
    pub fn execute_outside_transaction(&self, sql: &str) -> TelemetryResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Run `f` under a savepoint so one bad item does not poison the batch.
fn with_savepoint<T, F>(conn: &Connection, f: F) -> TelemetryResult<T>
where
    F: FnOnce(&Connection) -> TelemetryResult<T>,
{
    conn.execute_batch("SAVEPOINT item")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE item")?;
            Ok(value)
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO item; RELEASE item")
                .map_err(|e| TelemetryError::Unrecoverable(format!("savepoint rollback failed: {}", e)))?;
            Err(err)
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Value Lanes
// ----------------------------------------------------------------------------

/// Storage lane a value lands in. Integers first, then finite floats, else text.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneValue {
    Int(i64),
    Real(f64),
    Text(String),
}

impl LaneValue {
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return LaneValue::Int(v);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => LaneValue::Real(v),
            _ => LaneValue::Text(raw.to_string()),
        }
    }
}

const INSERT_VALUE_INT: &str =
    "INSERT OR IGNORE INTO MetricValueInt (InstanceID, Timestamp, Value) VALUES (?1, ?2, ?3)";
const INSERT_VALUE_REAL: &str =
    "INSERT OR IGNORE INTO MetricValueReal (InstanceID, Timestamp, Value) VALUES (?1, ?2, ?3)";
const INSERT_VALUE_TEXT: &str =
    "INSERT OR IGNORE INTO MetricValueText (InstanceID, Timestamp, Value) VALUES (?1, ?2, ?3)";

/// Append one value row. A repeated (instance, timestamp) is ignored.
pub fn insert_metric_value(conn: &Connection, write: &ValueWrite) -> TelemetryResult<usize> {
    let ts = write.timestamp.as_nanos();
    let changed = match LaneValue::classify(&write.value) {
        LaneValue::Int(v) => conn
            .prepare_cached(INSERT_VALUE_INT)?
            .execute(params![write.instance_id, ts, v])?,
        LaneValue::Real(v) => conn
            .prepare_cached(INSERT_VALUE_REAL)?
            .execute(params![write.instance_id, ts, v])?,
        LaneValue::Text(v) => conn
            .prepare_cached(INSERT_VALUE_TEXT)?
            .execute(params![write.instance_id, ts, v])?,
    };
    Ok(changed)
}

// ============================================================================
// SECTION 8: METRIC DEFINITION REGISTRY
// ============================================================================
// Declared metric identities plus the pattern records (MetricMeta) report
// definitions resolve to. Pure data and lookup.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Metric Definitions
// ----------------------------------------------------------------------------

/// Redfish `MetricDefinition` resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDefinition {
    #[serde(rename = "Id")]
    pub metric_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metric_type: String,
    #[serde(default)]
    pub metric_data_type: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub accuracy: f32,
    #[serde(default)]
    pub sensing_interval: String,
    #[serde(default)]
    pub discrete_values: Vec<String>,
    /// FQDD and Source patterns the definition applies to
    #[serde(rename = "Oem", alias = "OEM", default)]
    pub oem: RuleOem,
}

const INSERT_METRIC_DEFINITION: &str = "
INSERT INTO MetricDefinition
    (MetricID, Name, Description, MetricType, MetricDataType, Units, Accuracy, SensingInterval, DiscreteValues,
     FQDDPattern, SourcePattern)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const SELECT_METRIC_DEFINITION: &str = "
SELECT MetricID, Name, Description, MetricType, MetricDataType, Units, Accuracy, SensingInterval, DiscreteValues,
       FQDDPattern, SourcePattern
FROM MetricDefinition WHERE MetricID = ?1";

pub fn insert_metric_definition(conn: &Connection, md: &MetricDefinition) -> TelemetryResult<String> {
    if md.metric_id.trim().is_empty() {
        return Err(TelemetryError::InvalidRequest("MetricDefinition requires an Id".into()));
    }
    let discrete = serde_json::to_string(&md.discrete_values)?;
    conn.prepare_cached(INSERT_METRIC_DEFINITION)?
        .execute(params![
            md.metric_id,
            md.name,
            md.description,
            md.metric_type,
            md.metric_data_type,
            md.units,
            md.accuracy as f64,
            md.sensing_interval,
            discrete,
            md.oem.dell.fqdd,
            md.oem.dell.source,
        ])
        .map_err(|e| {
            if is_constraint_violation(&e) {
                TelemetryError::already_exists(ResourceKind::MetricDefinition, &md.metric_id)
            } else {
                e.into()
            }
        })?;
    Ok(format!("{}/{}", MD_COLLECTION_URI, md.metric_id))
}

pub fn find_metric_definition(conn: &Connection, metric_id: &str) -> TelemetryResult<Option<MetricDefinition>> {
    let row = conn
        .prepare_cached(SELECT_METRIC_DEFINITION)?
        .query_row([metric_id], |row| {
            Ok((
                MetricDefinition {
                    metric_id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    metric_type: row.get(3)?,
                    metric_data_type: row.get(4)?,
                    units: row.get(5)?,
                    accuracy: row.get::<_, f64>(6)? as f32,
                    sensing_interval: row.get(7)?,
                    discrete_values: Vec::new(),
                    oem: RuleOem {
                        dell: RuleOemDell {
                            fqdd: row.get(9)?,
                            source: row.get(10)?,
                        },
                    },
                },
                row.get::<_, String>(8)?,
            ))
        })
        .optional()?;

    match row {
        Some((mut md, discrete)) => {
            md.discrete_values = serde_json::from_str(&discrete)?;
            Ok(Some(md))
        }
        None => Ok(None),
    }
}

// ----------------------------------------------------------------------------
// 8.2 Trigger Definitions
// ----------------------------------------------------------------------------

/// Redfish `Triggers` resource. Stored as its JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerDefinition {
    #[serde(rename = "Id")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metric_type: String,
    #[serde(default)]
    pub trigger_actions: Vec<String>,
    #[serde(default)]
    pub metric_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_thresholds: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrete_triggers: Vec<JsonValue>,
}

pub fn insert_trigger(conn: &Connection, trigger: &TriggerDefinition) -> TelemetryResult<String> {
    if trigger.name.trim().is_empty() {
        return Err(TelemetryError::InvalidRequest("Trigger requires an Id".into()));
    }
    let body = serde_json::to_string(trigger)?;
    conn.prepare_cached("INSERT INTO TriggerDefinition (Name, Body) VALUES (?1, ?2)")?
        .execute(params![trigger.name, body])
        .map_err(|e| {
            if is_constraint_violation(&e) {
                TelemetryError::already_exists(ResourceKind::Trigger, &trigger.name)
            } else {
                e.into()
            }
        })?;
    Ok(format!("{}/{}", TRIGGER_COLLECTION_URI, trigger.name))
}

// ----------------------------------------------------------------------------
// 8.3 Metric Meta - Resolved Pattern Records
// ----------------------------------------------------------------------------

/// Shared (pattern x collection settings) record that instances hang off.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricMeta {
    pub id: i64,
    pub name_pattern: String,
    pub fqdd_pattern: String,
    pub source_pattern: String,
    pub property_pattern: String,
    pub wildcards: BTreeMap<String, Vec<String>>,
    pub collection_function: Option<CollectionFunction>,
    pub collection_duration: Duration,
    pub suppress_dups: bool,
}

impl MetricMeta {
    /// Instance label: "<Context> <Name>", plus the aggregation when present
    pub fn instance_label(&self, sample: &MetricSample) -> String {
        let base = format!("{} {}", sample.context, sample.name).trim().to_string();
        match self.collection_function {
            Some(func) => format!(
                "{} - {} ({})",
                base,
                func,
                humantime::format_duration(self.collection_duration)
            ),
            None => base,
        }
    }
}

const SELECT_ALL_META: &str = "
SELECT ID, NamePattern, FQDDPattern, SourcePattern, PropertyPattern, Wildcards,
       CollectionFunction, CollectionDuration, SuppressDups
FROM MetricMeta ORDER BY ID";

const INSERT_META: &str = "
INSERT OR IGNORE INTO MetricMeta
    (NamePattern, FQDDPattern, SourcePattern, PropertyPattern, Wildcards,
     CollectionFunction, CollectionDuration, SuppressDups)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const SELECT_META_ID: &str = "
SELECT ID FROM MetricMeta
WHERE NamePattern = ?1 AND FQDDPattern = ?2 AND SourcePattern = ?3 AND PropertyPattern = ?4
  AND Wildcards = ?5 AND CollectionFunction = ?6 AND CollectionDuration = ?7 AND SuppressDups = ?8";

pub fn load_all_metas(conn: &Connection) -> TelemetryResult<Vec<MetricMeta>> {
    let mut stmt = conn.prepare_cached(SELECT_ALL_META)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, bool>(8)?,
        ))
    })?;

    let mut metas = Vec::new();
    for row in rows {
        let (id, name, fqdd, source, property, wildcards, function, duration, suppress) = row?;
        metas.push(MetricMeta {
            id,
            name_pattern: name,
            fqdd_pattern: fqdd,
            source_pattern: source,
            property_pattern: property,
            wildcards: serde_json::from_str(&wildcards)?,
            collection_function: CollectionFunction::parse(&function),
            collection_duration: nanos_duration(duration),
            suppress_dups: suppress,
        });
    }
    Ok(metas)
}

/// Meta rows are shared: identical shapes resolve to the same ID.
pub fn find_or_insert_meta(conn: &Connection, meta: &MetricMeta) -> TelemetryResult<i64> {
    let wildcards = serde_json::to_string(&meta.wildcards)?;
    let function = meta.collection_function.map(|f| f.as_str()).unwrap_or("");
    let duration = duration_nanos(meta.collection_duration);
    let args = params![
        meta.name_pattern,
        meta.fqdd_pattern,
        meta.source_pattern,
        meta.property_pattern,
        wildcards,
        function,
        duration,
        meta.suppress_dups,
    ];
    conn.prepare_cached(INSERT_META)?.execute(args)?;
    let id = conn.prepare_cached(SELECT_META_ID)?.query_row(args, |row| row.get(0))?;
    Ok(id)
}

// ----------------------------------------------------------------------------
// 8.4 Pattern Matching
// ----------------------------------------------------------------------------

/// Anchored regex for a `*`/`?` glob
fn glob_to_regex(pattern: &str) -> TelemetryResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| TelemetryError::InvalidRequest(format!("bad pattern '{}': {}", pattern, e)))
}

/// Property pattern with `{Name}` placeholders. A placeholder with declared
/// wildcard values matches only those; otherwise one path segment.
fn property_to_regex(pattern: &str, wildcards: &BTreeMap<String, Vec<String>>) -> TelemetryResult<Regex> {
    let mut out = String::from("^");
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        out.push_str(&glob_fragment(&rest[..open]));
        let name = &rest[open + 1..close];
        match wildcards.get(name).filter(|values| !values.is_empty()) {
            Some(values) => {
                let alternatives: Vec<String> = values.iter().map(|v| regex::escape(v)).collect();
                out.push_str(&format!("(?:{})", alternatives.join("|")));
            }
            None => out.push_str("[^/]+"),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(&glob_fragment(rest));
    out.push('$');
    Regex::new(&out).map_err(|e| TelemetryError::InvalidRequest(format!("bad property pattern '{}': {}", pattern, e)))
}

fn glob_fragment(text: &str) -> String {
    text.split('*').map(regex::escape).collect::<Vec<_>>().join(".*")
}

/// Compiled matcher for one MetricMeta
#[derive(Debug, Clone)]
pub struct MetaPattern {
    name: Regex,
    fqdd: Option<Regex>,
    source: Option<Regex>,
    property: Option<Regex>,
}

impl MetaPattern {
    pub fn compile(meta: &MetricMeta) -> TelemetryResult<Self> {
        let optional_glob = |p: &str| -> TelemetryResult<Option<Regex>> {
            if p.is_empty() {
                Ok(None)
            } else {
                glob_to_regex(p).map(Some)
            }
        };
        Ok(Self {
            name: glob_to_regex(&meta.name_pattern)?,
            fqdd: optional_glob(&meta.fqdd_pattern)?,
            source: optional_glob(&meta.source_pattern)?,
            property: if meta.property_pattern.is_empty() {
                None
            } else {
                Some(property_to_regex(&meta.property_pattern, &meta.wildcards)?)
            },
        })
    }

    /// Empty FQDD/Source/Property patterns match anything
    pub fn matches(&self, sample: &MetricSample) -> bool {
        self.name.is_match(&sample.name)
            && self.fqdd.as_ref().map_or(true, |re| re.is_match(&sample.fqdd))
            && self.source.as_ref().map_or(true, |re| re.is_match(&sample.source))
            && self.property.as_ref().map_or(true, |re| re.is_match(&sample.property))
    }
}

/// Compiled patterns keyed by MetaID. Meta rows never change and IDs are not
/// reused, so entries only go stale when a meta is garbage collected.
#[derive(Debug, Default)]
pub struct PatternCache {
    patterns: AHashMap<i64, MetaPattern>,
}

impl PatternCache {
    pub fn matches(&mut self, meta: &MetricMeta, sample: &MetricSample) -> TelemetryResult<bool> {
        if !self.patterns.contains_key(&meta.id) {
            self.patterns.insert(meta.id, MetaPattern::compile(meta)?);
        }
        Ok(self.matches_compiled(meta.id, sample).unwrap_or(false))
    }

    /// `None` until the meta's patterns have been compiled
    pub fn matches_compiled(&self, meta_id: i64, sample: &MetricSample) -> Option<bool> {
        self.patterns.get(&meta_id).map(|pattern| pattern.matches(sample))
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ============================================================================
// SECTION 9: AGGREGATION & DEDUP ENGINE
// ============================================================================
// Per-instance state machine. Pure: it decides which value rows to write and
// updates its own bookkeeping; persistence happens in SECTION 10.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Collection Scratch - Running Window Statistics
// ----------------------------------------------------------------------------

/// Running Sum/Count/Max/Min for the open collection window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CollectionScratch {
    pub numvalues: u64,
    pub sum: f64,
    pub maximum: f64,
    pub minimum: f64,
}

impl Default for CollectionScratch {
    fn default() -> Self {
        Self {
            numvalues: 0,
            sum: 0.0,
            maximum: -f64::MAX,
            minimum: f64::MAX,
        }
    }
}

impl CollectionScratch {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.numvalues == 0
    }

    pub fn add(&mut self, value: f64) {
        self.numvalues += 1;
        self.sum += value;
        self.maximum = self.maximum.max(value);
        self.minimum = self.minimum.min(value);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Aggregate for the window, `None` when nothing was collected
    pub fn value(&self, function: CollectionFunction) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(match function {
            CollectionFunction::Average => self.sum / self.numvalues as f64,
            CollectionFunction::Maximum => self.maximum,
            CollectionFunction::Minimum => self.minimum,
            CollectionFunction::Summation => self.sum,
        })
    }
}

// ----------------------------------------------------------------------------
// 9.2 Metric Instance - One Observed Stream
// ----------------------------------------------------------------------------

/// A value row the aggregation engine wants persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ValueWrite {
    pub instance_id: i64,
    pub timestamp: Timestamp,
    pub value: String,
}

/// Instance row joined with the collection settings of its MetricMeta.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricInstance {
    pub id: i64,
    pub meta_id: i64,
    pub name: String,
    pub property: String,
    pub context: String,
    pub fqdd: String,
    pub source: String,
    pub label: String,
    pub scratch: CollectionScratch,
    pub flush_time: Timestamp,
    pub last_ts: Timestamp,
    pub last_value: String,
    pub sensor_interval: Duration,
    pub sensor_slack: Duration,
    pub requires_expand: bool,
    pub dirty: bool,
    // From MetricMeta
    pub collection_function: Option<CollectionFunction>,
    pub collection_duration: Duration,
    pub suppress_dups: bool,
}

impl MetricInstance {
    /// Fold one sample in. Returns the rows to write, in timestamp order.
    pub fn ingest(&mut self, ts: Timestamp, value: &str, max_expand: Duration) -> Vec<ValueWrite> {
        let mut writes = Vec::new();

        let Some(function) = self.collection_function else {
            self.emit(ts, value.to_string(), max_expand, &mut writes);
            return writes;
        };

        let Ok(numeric) = value.trim().parse::<f64>() else {
            trace!(
                target: "telemetry::aggregate",
                instance = self.id,
                value,
                "Non-numeric sample skipped by aggregated metric"
            );
            return writes;
        };

        if ts >= self.flush_time {
            self.flush_window(function, max_expand, &mut writes);
            self.flush_time = ts.add_duration(self.collection_duration);
        }
        self.scratch.add(numeric);
        writes
    }

    /// Force-flush as of `hwm`: close a finished aggregation window and
    /// backfill expansion rows. Never writes a fresh reading.
    pub fn flush_at(&mut self, hwm: Timestamp, max_expand: Duration) -> Vec<ValueWrite> {
        let mut writes = Vec::new();
        if let Some(function) = self.collection_function {
            if hwm >= self.flush_time && !self.scratch.is_empty() {
                self.flush_window(function, max_expand, &mut writes);
                self.flush_time = hwm.add_duration(self.collection_duration);
            }
        }
        if !self.last_ts.is_epoch() {
            self.expand_to(hwm, max_expand, &mut writes);
        }
        writes
    }

    fn flush_window(&mut self, function: CollectionFunction, max_expand: Duration, writes: &mut Vec<ValueWrite>) {
        if let Some(aggregate) = self.scratch.value(function) {
            let stamp = self.flush_time;
            self.emit(stamp, aggregate.to_string(), max_expand, writes);
        }
        self.scratch.reset();
    }

    /// Dedup, backfill, then write
    fn emit(&mut self, ts: Timestamp, value: String, max_expand: Duration, writes: &mut Vec<ValueWrite>) {
        if !self.last_ts.is_epoch() {
            if self.suppress_dups && value == self.last_value {
                self.last_ts = self.last_ts.max(ts);
                return;
            }
            self.expand_to(ts, max_expand, writes);
        }
        writes.push(ValueWrite {
            instance_id: self.id,
            timestamp: ts,
            value: value.clone(),
        });
        self.last_ts = ts;
        self.last_value = value;
    }

    /// Repeat `last_value` at sensor cadence up to `ts`, covering at most
    /// `max_expand` of gap.
    fn expand_to(&mut self, ts: Timestamp, max_expand: Duration, writes: &mut Vec<ValueWrite>) {
        if !self.requires_expand || self.suppress_dups || self.sensor_interval.is_zero() {
            return;
        }
        let interval = duration_nanos(self.sensor_interval);
        let slack = duration_nanos(self.sensor_slack);
        let gap = ts.nanos_since(self.last_ts);
        if gap <= interval.saturating_add(slack) {
            return;
        }

        let missing = gap.min(duration_nanos(max_expand));
        let stop = ts.as_nanos().saturating_sub(slack);
        let mut t = ts.as_nanos() - missing + interval;
        while t < stop {
            let at = Timestamp::from_nanos(t);
            writes.push(ValueWrite {
                instance_id: self.id,
                timestamp: at,
                value: self.last_value.clone(),
            });
            self.last_ts = at;
            t += interval;
        }
    }
}

// ============================================================================
// SECTION 10: INSTANCE RESOLVER
// ============================================================================

const SELECT_INSTANCES_FOR_STREAM: &str = "
SELECT MI.ID, MI.MetaID, MI.Name, MI.Property, MI.Context, MI.FQDD, MI.Source, MI.Label,
       MI.CollectionScratch, MI.FlushTime, MI.LastTS, MI.LastValue,
       MI.MISensorInterval, MI.MISensorSlack, MI.MIRequiresExpand, MI.Dirty,
       MM.CollectionFunction, MM.CollectionDuration, MM.SuppressDups
FROM MetricInstance MI
JOIN MetricMeta MM ON MM.ID = MI.MetaID
WHERE MI.Name = ?1 AND MI.Property = ?2 AND MI.Context = ?3
ORDER BY MI.ID";

const SELECT_INSTANCES_FOR_REPORT: &str = "
SELECT MI.ID, MI.MetaID, MI.Name, MI.Property, MI.Context, MI.FQDD, MI.Source, MI.Label,
       MI.CollectionScratch, MI.FlushTime, MI.LastTS, MI.LastValue,
       MI.MISensorInterval, MI.MISensorSlack, MI.MIRequiresExpand, MI.Dirty,
       MM.CollectionFunction, MM.CollectionDuration, MM.SuppressDups
FROM ReportDefinitionToMetricMeta RDM
JOIN MetricMetaInstance MMI ON MMI.MetaID = RDM.MetricMetaID
JOIN MetricInstance MI ON MI.ID = MMI.InstanceID
JOIN MetricMeta MM ON MM.ID = MI.MetaID
WHERE RDM.ReportDefID = ?1
ORDER BY MI.ID";

const INSERT_INSTANCE: &str = "
INSERT OR IGNORE INTO MetricInstance
    (MetaID, Name, Property, Context, FQDD, Source, Label, CollectionScratch, FlushTime,
     LastTS, LastValue, MISensorInterval, MISensorSlack, MIRequiresExpand, Dirty)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, '', ?10, ?11, ?12, 0)";

const INSERT_META_INSTANCE: &str = "
INSERT OR IGNORE INTO MetricMetaInstance (MetaID, InstanceID)
SELECT ?1, ID FROM MetricInstance
WHERE MetaID = ?1 AND Name = ?2 AND Property = ?3 AND Context = ?4 AND Label = ?5";

const CLEAR_DIRTY_FOR_STREAM: &str = "
UPDATE MetricInstance SET Dirty = 0 WHERE Name = ?1 AND Property = ?2 AND Context = ?3";

const UPDATE_INSTANCE_STATE: &str = "
UPDATE MetricInstance
SET CollectionScratch = ?2, FlushTime = ?3, LastTS = ?4, LastValue = ?5,
    MISensorInterval = ?6, MISensorSlack = ?7, MIRequiresExpand = ?8
WHERE ID = ?1";

fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MetricInstance, String)> {
    Ok((
        MetricInstance {
            id: row.get(0)?,
            meta_id: row.get(1)?,
            name: row.get(2)?,
            property: row.get(3)?,
            context: row.get(4)?,
            fqdd: row.get(5)?,
            source: row.get(6)?,
            label: row.get(7)?,
            scratch: CollectionScratch::default(),
            flush_time: Timestamp::from_nanos(row.get(9)?),
            last_ts: Timestamp::from_nanos(row.get(10)?),
            last_value: row.get(11)?,
            sensor_interval: nanos_duration(row.get(12)?),
            sensor_slack: nanos_duration(row.get(13)?),
            requires_expand: row.get(14)?,
            dirty: row.get(15)?,
            collection_function: CollectionFunction::parse(&row.get::<_, String>(16)?),
            collection_duration: nanos_duration(row.get(17)?),
            suppress_dups: row.get(18)?,
        },
        row.get(8)?,
    ))
}

fn query_instances<P: rusqlite::Params>(conn: &Connection, sql: &str, args: P) -> TelemetryResult<Vec<MetricInstance>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(args, instance_from_row)?;
    let mut instances = Vec::new();
    for row in rows {
        let (mut instance, scratch) = row?;
        instance.scratch = match serde_json::from_str(&scratch) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(
                    target: "telemetry::aggregate",
                    instance = instance.id,
                    label = %instance.label,
                    error = %err,
                    "Collection scratch unreadable, restarting window"
                );
                CollectionScratch::default()
            }
        };
        instances.push(instance);
    }
    Ok(instances)
}

/// Instances currently bound to the (Name, Property, Context) stream
pub fn load_stream_instances(conn: &Connection, sample: &MetricSample) -> TelemetryResult<Vec<MetricInstance>> {
    query_instances(
        conn,
        SELECT_INSTANCES_FOR_STREAM,
        params![sample.name, sample.property, sample.context],
    )
}

/// Instances feeding a report definition
pub fn load_report_instances(conn: &Connection, report_def_id: i64) -> TelemetryResult<Vec<MetricInstance>> {
    query_instances(conn, SELECT_INSTANCES_FOR_REPORT, params![report_def_id])
}

/// Persist the bookkeeping an `ingest`/`flush_at` call changed
pub fn save_instance_state(conn: &Connection, instance: &MetricInstance) -> TelemetryResult<()> {
    let scratch = serde_json::to_string(&instance.scratch)?;
    conn.prepare_cached(UPDATE_INSTANCE_STATE)?.execute(params![
        instance.id,
        scratch,
        instance.flush_time.as_nanos(),
        instance.last_ts.as_nanos(),
        instance.last_value,
        duration_nanos(instance.sensor_interval),
        duration_nanos(instance.sensor_slack),
        instance.requires_expand,
    ])?;
    Ok(())
}

/// Outcome of resolving one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub instances: Vec<MetricInstance>,
    /// IDs of instances created for this sample
    pub created: Vec<i64>,
}

/// Find or create every instance the sample feeds.
///
/// The fast path loads instances by stream key and keeps those whose meta
/// still matches the sample. When none match, or any of them is dirty
/// because a definition changed, every MetricMeta is re-matched, missing
/// instances are created and the dirty flags cleared.
pub fn resolve_instances(
    conn: &Connection,
    patterns: &mut PatternCache,
    sample: &MetricSample,
) -> TelemetryResult<Resolution> {
    let instances = load_stream_instances(conn, sample)?;
    if !instances.iter().any(|i| i.dirty) {
        let wanted = retain_matching(conn, patterns, instances.clone(), sample)?;
        if !wanted.is_empty() {
            return Ok(Resolution {
                instances: wanted,
                created: Vec::new(),
            });
        }
    }

    let known: BTreeSet<i64> = instances.iter().map(|i| i.id).collect();
    for meta in load_all_metas(conn)? {
        if !patterns.matches(&meta, sample)? {
            continue;
        }
        let label = meta.instance_label(sample);
        let flush_time = sample.timestamp.add_duration(meta.collection_duration);
        let scratch = serde_json::to_string(&CollectionScratch::default())?;
        conn.prepare_cached(INSERT_INSTANCE)?.execute(params![
            meta.id,
            sample.name,
            sample.property,
            sample.context,
            sample.fqdd,
            sample.source,
            label,
            scratch,
            flush_time.as_nanos(),
            duration_nanos(sample.sensor_interval),
            duration_nanos(sample.sensor_slack),
            sample.requires_expand,
        ])?;
        conn.prepare_cached(INSERT_META_INSTANCE)?.execute(params![
            meta.id,
            sample.name,
            sample.property,
            sample.context,
            label,
        ])?;
    }
    conn.prepare_cached(CLEAR_DIRTY_FOR_STREAM)?
        .execute(params![sample.name, sample.property, sample.context])?;

    let instances = retain_matching(conn, patterns, load_stream_instances(conn, sample)?, sample)?;
    let created = instances
        .iter()
        .map(|i| i.id)
        .filter(|id| !known.contains(id))
        .collect::<Vec<_>>();
    if !created.is_empty() {
        debug!(
            target: "telemetry::resolver",
            metric = %sample.name,
            context = %sample.context,
            created = created.len(),
            "Metric instances created"
        );
    }
    Ok(Resolution { instances, created })
}

/// Drop instances whose meta patterns (FQDD, Source, Property) reject the
/// sample. A stream key can be shared by samples from different devices.
fn retain_matching(
    conn: &Connection,
    patterns: &mut PatternCache,
    instances: Vec<MetricInstance>,
    sample: &MetricSample,
) -> TelemetryResult<Vec<MetricInstance>> {
    if instances
        .iter()
        .any(|i| patterns.matches_compiled(i.meta_id, sample).is_none())
    {
        for meta in load_all_metas(conn)? {
            patterns.matches(&meta, sample)?;
        }
    }
    Ok(instances
        .into_iter()
        .filter(|i| patterns.matches_compiled(i.meta_id, sample).unwrap_or(false))
        .collect())
}

/// Resolve a sample and apply it once to every instance it feeds. Returns
/// the IDs of instances that wrote at least one value row.
pub fn ingest_sample(
    conn: &Connection,
    patterns: &mut PatternCache,
    sample: &MetricSample,
    max_expand: Duration,
) -> TelemetryResult<Vec<i64>> {
    let resolution = resolve_instances(conn, patterns, sample)?;
    if resolution.instances.is_empty() {
        trace!(target: "telemetry::resolver", metric = %sample.name, "No report wants this metric");
    }

    let mut updated = Vec::new();
    for mut instance in resolution.instances {
        instance.requires_expand = sample.requires_expand;
        instance.sensor_interval = sample.sensor_interval;
        instance.sensor_slack = sample.sensor_slack;

        let written = apply_value(conn, &mut instance, sample, max_expand)?;
        if written > 0 {
            updated.push(instance.id);
        }
    }
    Ok(updated)
}

/// Run one sample through the instance state machine and persist the result
pub fn apply_value(
    conn: &Connection,
    instance: &mut MetricInstance,
    sample: &MetricSample,
    max_expand: Duration,
) -> TelemetryResult<usize> {
    let writes = instance.ingest(sample.timestamp, &sample.value, max_expand);
    persist_writes(conn, instance, &writes)
}

fn persist_writes(conn: &Connection, instance: &MetricInstance, writes: &[ValueWrite]) -> TelemetryResult<usize> {
    let mut written = 0;
    for write in writes {
        written += insert_metric_value(conn, write)?;
    }
    save_instance_state(conn, instance)?;
    Ok(written)
}

// ============================================================================
// SECTION 11: REPORT DEFINITION STORE
// ============================================================================
// Metric Report Definitions in their Redfish JSON shape, the Type x Updates
// normalization matrix, and the storage statements behind MRD CRUD.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Definition Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportSchedule {
    /// Period of a Periodic report
    #[serde(default, with = "redfish_duration")]
    pub recurrence_interval: Duration,
}

/// Values a `{Name}` placeholder in a property pattern may take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Wildcard {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleOem {
    #[serde(rename = "Dell", default)]
    pub dell: RuleOemDell,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleOemDell {
    #[serde(rename = "FQDD", default)]
    pub fqdd: String,
    #[serde(rename = "Source", default)]
    pub source: String,
}

/// One entry of `Metrics`: which samples to collect and how to aggregate them
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricRule {
    #[serde(rename = "MetricId", alias = "MetricID")]
    pub metric_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_properties: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_collection_function"
    )]
    pub collection_function: Option<CollectionFunction>,
    #[serde(default, with = "redfish_duration")]
    pub collection_duration: Duration,
    #[serde(rename = "Oem", alias = "OEM", default)]
    pub oem: RuleOem,
}

impl MetricRule {
    pub fn new(metric_id: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            ..Self::default()
        }
    }

    pub fn aggregated(mut self, function: CollectionFunction, duration: Duration) -> Self {
        self.collection_function = Some(function);
        self.collection_duration = duration;
        self
    }

    pub fn with_property(mut self, pattern: impl Into<String>) -> Self {
        self.metric_properties.push(pattern.into());
        self
    }

    pub fn with_fqdd(mut self, pattern: impl Into<String>) -> Self {
        self.oem.dell.fqdd = pattern.into();
        self
    }
}

/// Redfish `MetricReportDefinition`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricReportDefinition {
    #[serde(rename = "Id")]
    pub name: String,
    #[serde(rename = "Name", default)]
    pub short_desc: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "MetricReportDefinitionType", default)]
    pub report_type: ReportType,
    #[serde(default)]
    pub report_actions: Vec<String>,
    #[serde(default)]
    pub report_updates: ReportUpdates,
    #[serde(rename = "ReportTimespan", default, with = "redfish_duration")]
    pub time_span: Duration,
    #[serde(rename = "MetricReportDefinitionEnabled", default)]
    pub enabled: bool,
    #[serde(rename = "SuppressRepeatedMetricValue", default)]
    pub suppress_dups: bool,
    #[serde(default)]
    pub schedule: ReportSchedule,
    #[serde(rename = "MetricReportHeartbeatInterval", default, with = "redfish_duration")]
    pub heartbeat: Duration,
    /// 0 picks up the configured default
    #[serde(default)]
    pub append_limit: u32,
    #[serde(default)]
    pub wildcards: Vec<Wildcard>,
    #[serde(default)]
    pub metrics: Vec<MetricRule>,
}

impl MetricReportDefinition {
    /// Enabled definition with no metrics yet
    pub fn new(name: impl Into<String>, report_type: ReportType, report_updates: ReportUpdates) -> Self {
        let name = name.into();
        Self {
            short_desc: name.clone(),
            name,
            description: String::new(),
            report_type,
            report_actions: vec!["LogToMetricReportsCollection".to_string()],
            report_updates,
            time_span: Duration::ZERO,
            enabled: true,
            suppress_dups: false,
            schedule: ReportSchedule::default(),
            heartbeat: Duration::ZERO,
            append_limit: 0,
            wildcards: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.schedule.recurrence_interval = period;
        self
    }

    pub fn with_time_span(mut self, span: Duration) -> Self {
        self.time_span = span;
        self
    }

    pub fn with_suppress_dups(mut self, suppress: bool) -> Self {
        self.suppress_dups = suppress;
        self
    }

    pub fn with_metric(mut self, rule: MetricRule) -> Self {
        self.metrics.push(rule);
        self
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.schedule.recurrence_interval
    }

    /// Length of the report window: Period for Periodic, TimeSpan otherwise
    pub fn window(&self) -> Duration {
        match self.report_type {
            ReportType::Periodic => self.period(),
            _ => self.time_span,
        }
    }

    pub fn uri(&self) -> String {
        format!("{}/{}", MRD_COLLECTION_URI, self.name)
    }

    /// Expand rules into MetricMeta shapes, one per property pattern
    pub fn metric_metas(&self) -> Vec<MetricMeta> {
        let mut metas = Vec::new();
        for rule in &self.metrics {
            let properties = if rule.metric_properties.is_empty() {
                vec![String::new()]
            } else {
                rule.metric_properties.clone()
            };
            for property in properties {
                let wildcards = placeholder_names(&property)
                    .into_iter()
                    .filter_map(|name| {
                        self.wildcards
                            .iter()
                            .find(|w| w.name == name)
                            .map(|w| (w.name.clone(), w.values.clone()))
                    })
                    .collect();
                metas.push(MetricMeta {
                    id: 0,
                    name_pattern: rule.metric_id.clone(),
                    fqdd_pattern: rule.oem.dell.fqdd.clone(),
                    source_pattern: rule.oem.dell.source.clone(),
                    property_pattern: property,
                    wildcards,
                    collection_function: rule.collection_function,
                    collection_duration: if rule.collection_function.is_some() {
                        rule.collection_duration
                    } else {
                        Duration::ZERO
                    },
                    suppress_dups: self.suppress_dups,
                });
            }
        }
        metas
    }
}

/// `{Name}` placeholders in a property pattern
fn placeholder_names(pattern: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        match rest[open..].find('}') {
            Some(close) => {
                names.push(&rest[open + 1..open + close]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    names
}

// ----------------------------------------------------------------------------
// 11.2 Validation & Normalization
// ----------------------------------------------------------------------------

/// One field rewritten by validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    pub field: &'static str,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Default)]
struct Normalizer {
    changes: Vec<Normalization>,
}

impl Normalizer {
    fn set<T: PartialEq + fmt::Debug>(&mut self, field: &'static str, slot: &mut T, value: T) {
        if *slot != value {
            self.changes.push(Normalization {
                field,
                from: format!("{:?}", slot),
                to: format!("{:?}", value),
            });
            *slot = value;
        }
    }
}

/// Clamp Period/TimeSpan and force Type/Updates into a supported combination.
/// Never fails; every change is returned so the caller can log it.
pub fn validate_report_definition(
    mrd: &mut MetricReportDefinition,
    limits: &ReportLimits,
    default_append_limit: u32,
) -> Vec<Normalization> {
    let mut n = Normalizer::default();
    let clamp_span = |span: Duration| span.clamp(limits.min_time_span, limits.max_time_span);

    match mrd.report_type {
        ReportType::Periodic => {
            let period = if mrd.period().is_zero() {
                limits.default_period
            } else {
                mrd.period().clamp(limits.min_period, limits.max_period)
            };
            n.set("Schedule.RecurrenceInterval", &mut mrd.schedule.recurrence_interval, period);

            if mrd.report_updates == ReportUpdates::Unrecognized {
                n.set("ReportUpdates", &mut mrd.report_updates, ReportUpdates::Overwrite);
            }

            let span = if !mrd.time_span.is_zero() {
                clamp_span(mrd.time_span)
            } else if mrd.report_updates.is_append() {
                limits.max_time_span
            } else {
                Duration::ZERO
            };
            n.set("ReportTimespan", &mut mrd.time_span, span);
        }
        ReportType::OnChange => {
            n.set("Schedule.RecurrenceInterval", &mut mrd.schedule.recurrence_interval, Duration::ZERO);
            if mrd.report_updates == ReportUpdates::Unrecognized {
                n.set("ReportUpdates", &mut mrd.report_updates, ReportUpdates::Overwrite);
            }
            let span = if mrd.time_span.is_zero() {
                limits.max_time_span
            } else {
                clamp_span(mrd.time_span)
            };
            n.set("ReportTimespan", &mut mrd.time_span, span);
        }
        ReportType::OnRequest => {
            n.set("Schedule.RecurrenceInterval", &mut mrd.schedule.recurrence_interval, Duration::ZERO);
            let span = if mrd.time_span.is_zero() {
                limits.max_time_span
            } else {
                clamp_span(mrd.time_span)
            };
            n.set("ReportTimespan", &mut mrd.time_span, span);
            n.set("ReportUpdates", &mut mrd.report_updates, ReportUpdates::AppendWrapsWhenFull);
            n.set("ReportActions", &mut mrd.report_actions, Vec::new());
        }
        ReportType::Unrecognized => {
            n.set("MetricReportDefinitionType", &mut mrd.report_type, ReportType::OnRequest);
            n.set("MetricReportDefinitionEnabled", &mut mrd.enabled, false);
            n.set("Schedule.RecurrenceInterval", &mut mrd.schedule.recurrence_interval, Duration::ZERO);
            n.set("ReportTimespan", &mut mrd.time_span, limits.max_time_span);
            n.set("ReportUpdates", &mut mrd.report_updates, ReportUpdates::AppendWrapsWhenFull);
            n.set("ReportActions", &mut mrd.report_actions, Vec::new());
        }
    }

    if mrd.append_limit == 0 {
        n.set("AppendLimit", &mut mrd.append_limit, default_append_limit);
    }

    n.changes
}

/// RFC 7386 JSON merge patch
pub fn json_merge_patch(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = JsonValue::Object(serde_json::Map::new());
    }
    if let JsonValue::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                json_merge_patch(target_map.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Definition Storage
// ----------------------------------------------------------------------------

/// A definition together with its row ID
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReportDefinition {
    pub id: i64,
    pub definition: MetricReportDefinition,
}

const INSERT_MRD: &str = "
INSERT INTO MetricReportDefinition
    (Name, ShortDesc, LongDesc, Type, Updates, Actions, Wildcards, Metrics, SuppressDups,
     Enabled, Period, TimeSpan, HeartbeatInterval, AppendLimit)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const UPDATE_MRD: &str = "
UPDATE MetricReportDefinition
SET Name = ?1, ShortDesc = ?2, LongDesc = ?3, Type = ?4, Updates = ?5, Actions = ?6,
    Wildcards = ?7, Metrics = ?8, SuppressDups = ?9, Enabled = ?10, Period = ?11,
    TimeSpan = ?12, HeartbeatInterval = ?13, AppendLimit = ?14
WHERE ID = ?15";

const SELECT_MRD_BY_NAME: &str = "
SELECT ID, Name, ShortDesc, LongDesc, Type, Updates, Actions, Wildcards, Metrics, SuppressDups,
       Enabled, Period, TimeSpan, HeartbeatInterval, AppendLimit
FROM MetricReportDefinition WHERE Name = ?1";

const SELECT_MRD_SCHEDULE_STATE: &str = "
SELECT MRD.Name, MRD.Type, MRD.Enabled,
       (SELECT COUNT(*) FROM MetricReport MR WHERE MR.ReportDefinitionID = MRD.ID)
FROM MetricReportDefinition MRD ORDER BY MRD.Name";

const SELECT_ONCHANGE_FOR_INSTANCE: &str = "
SELECT DISTINCT MRD.Name
FROM MetricMetaInstance MMI
JOIN ReportDefinitionToMetricMeta RDM ON RDM.MetricMetaID = MMI.MetaID
JOIN MetricReportDefinition MRD ON MRD.ID = RDM.ReportDefID
WHERE MMI.InstanceID = ?1 AND MRD.Type = 'OnChange' AND MRD.Enabled = 1";

pub fn insert_report_definition(conn: &Connection, mrd: &MetricReportDefinition) -> TelemetryResult<i64> {
    if mrd.name.trim().is_empty() {
        return Err(TelemetryError::InvalidRequest("MetricReportDefinition requires an Id".into()));
    }
    let actions = serde_json::to_string(&mrd.report_actions)?;
    let wildcards = serde_json::to_string(&mrd.wildcards)?;
    let metrics = serde_json::to_string(&mrd.metrics)?;
    conn.prepare_cached(INSERT_MRD)?
        .execute(params![
            mrd.name,
            mrd.short_desc,
            mrd.description,
            mrd.report_type.as_str(),
            mrd.report_updates.as_str(),
            actions,
            wildcards,
            metrics,
            mrd.suppress_dups,
            mrd.enabled,
            duration_nanos(mrd.period()),
            duration_nanos(mrd.time_span),
            duration_nanos(mrd.heartbeat),
            mrd.append_limit,
        ])
        .map_err(|e| {
            if is_constraint_violation(&e) {
                TelemetryError::already_exists(ResourceKind::ReportDefinition, &mrd.name)
            } else {
                e.into()
            }
        })?;
    Ok(conn.last_insert_rowid())
}

pub fn update_report_definition(conn: &Connection, id: i64, mrd: &MetricReportDefinition) -> TelemetryResult<()> {
    let actions = serde_json::to_string(&mrd.report_actions)?;
    let wildcards = serde_json::to_string(&mrd.wildcards)?;
    let metrics = serde_json::to_string(&mrd.metrics)?;
    conn.prepare_cached(UPDATE_MRD)?.execute(params![
        mrd.name,
        mrd.short_desc,
        mrd.description,
        mrd.report_type.as_str(),
        mrd.report_updates.as_str(),
        actions,
        wildcards,
        metrics,
        mrd.suppress_dups,
        mrd.enabled,
        duration_nanos(mrd.period()),
        duration_nanos(mrd.time_span),
        duration_nanos(mrd.heartbeat),
        mrd.append_limit,
        id,
    ])?;
    Ok(())
}

pub fn find_report_definition(conn: &Connection, name: &str) -> TelemetryResult<Option<StoredReportDefinition>> {
    struct Raw {
        id: i64,
        definition: MetricReportDefinition,
        actions: String,
        wildcards: String,
        metrics: String,
    }

    let raw = conn
        .prepare_cached(SELECT_MRD_BY_NAME)?
        .query_row([name], |row| {
            let name: String = row.get(1)?;
            Ok(Raw {
                id: row.get(0)?,
                definition: MetricReportDefinition {
                    short_desc: row.get(2)?,
                    description: row.get(3)?,
                    report_type: ReportType::from_db(&row.get::<_, String>(4)?),
                    report_actions: Vec::new(),
                    report_updates: ReportUpdates::from_db(&row.get::<_, String>(5)?),
                    time_span: nanos_duration(row.get(12)?),
                    enabled: row.get(10)?,
                    suppress_dups: row.get(9)?,
                    schedule: ReportSchedule {
                        recurrence_interval: nanos_duration(row.get(11)?),
                    },
                    heartbeat: nanos_duration(row.get(13)?),
                    append_limit: row.get(14)?,
                    wildcards: Vec::new(),
                    metrics: Vec::new(),
                    name,
                },
                actions: row.get(6)?,
                wildcards: row.get(7)?,
                metrics: row.get(8)?,
            })
        })
        .optional()?;

    let Some(mut raw) = raw else {
        return Ok(None);
    };
    raw.definition.report_actions = serde_json::from_str(&raw.actions)?;
    raw.definition.wildcards = serde_json::from_str(&raw.wildcards)?;
    raw.definition.metrics = serde_json::from_str(&raw.metrics)?;
    Ok(Some(StoredReportDefinition {
        id: raw.id,
        definition: raw.definition,
    }))
}

/// Delete a definition; reports and meta links cascade
pub fn delete_report_definition(conn: &Connection, name: &str) -> TelemetryResult<()> {
    let removed = conn
        .prepare_cached("DELETE FROM MetricReportDefinition WHERE Name = ?1")?
        .execute([name])?;
    if removed == 0 {
        return Err(TelemetryError::not_found(ResourceKind::ReportDefinition, name));
    }
    Ok(())
}

pub fn delete_metric_report(conn: &Connection, name: &str) -> TelemetryResult<()> {
    let removed = conn
        .prepare_cached("DELETE FROM MetricReport WHERE Name = ?1")?
        .execute([name])?;
    if removed == 0 {
        return Err(TelemetryError::not_found(ResourceKind::Report, name));
    }
    Ok(())
}

pub fn delete_reports_for_definition(conn: &Connection, report_def_id: i64) -> TelemetryResult<usize> {
    Ok(conn
        .prepare_cached("DELETE FROM MetricReport WHERE ReportDefinitionID = ?1")?
        .execute([report_def_id])?)
}

/// Replace the MetricMeta links of a definition and mark every instance
/// dirty so the next sample on each stream re-matches.
pub fn replace_metric_meta_links(
    conn: &Connection,
    report_def_id: i64,
    mrd: &MetricReportDefinition,
) -> TelemetryResult<usize> {
    conn.prepare_cached("DELETE FROM ReportDefinitionToMetricMeta WHERE ReportDefID = ?1")?
        .execute([report_def_id])?;
    conn.prepare_cached("UPDATE MetricInstance SET Dirty = 1")?.execute([])?;

    let mut linked = 0;
    for meta in mrd.metric_metas() {
        let meta_id = find_or_insert_meta(conn, &meta)?;
        linked += conn
            .prepare_cached(
                "INSERT OR IGNORE INTO ReportDefinitionToMetricMeta (ReportDefID, MetricMetaID) VALUES (?1, ?2)",
            )?
            .execute([report_def_id, meta_id])?;
    }
    Ok(linked)
}

/// (name, type, enabled, report count) for every definition
pub fn load_schedule_state(conn: &Connection) -> TelemetryResult<Vec<(String, ReportType, bool, i64)>> {
    let mut stmt = conn.prepare_cached(SELECT_MRD_SCHEDULE_STATE)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            ReportType::from_db(&row.get::<_, String>(1)?),
            row.get::<_, bool>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Enabled OnChange definitions fed by an instance
pub fn onchange_reports_for_instance(conn: &Connection, instance_id: i64) -> TelemetryResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(SELECT_ONCHANGE_FOR_INSTANCE)?;
    let rows = stmt.query_map([instance_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ============================================================================
// SECTION 12: CLOCK & SCHEDULER
// ============================================================================
// The report clock is the high-water mark (HWM) of ingested sample
// timestamps. A wall-clock tick nudges it forward when the data source stalls.
// ============================================================================

/// Report clock, per-definition schedule and the maintenance dirty set.
///
/// Owned by the event-loop task: [`TelemetryEngine`] holds the only instance
/// and every mutation happens inside an event handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerState {
    hwm: Timestamp,
    last_tick_hwm: Timestamp,
    next_mrts: BTreeMap<String, Timestamp>,
    last_mrts: BTreeMap<String, Timestamp>,
    pending_insert: BTreeSet<String>,
    maintenance: BTreeSet<MaintenanceCommand>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn hwm(&self) -> Timestamp {
        self.hwm
    }

    /// Raise the HWM to `ts`; never lowers it. Returns true when it moved.
    pub fn observe(&mut self, ts: Timestamp) -> bool {
        if ts > self.hwm {
            self.hwm = ts;
            true
        } else {
            false
        }
    }

    /// Overwrite the HWM (startup resync, drift correction)
    pub fn reset_hwm(&mut self, ts: Timestamp) {
        self.hwm = ts;
        self.last_tick_hwm = ts;
    }

    /// Tick bookkeeping: if nothing moved the HWM since the last tick, push it
    /// forward by `period`.
    pub fn advance_clock(&mut self, period: Duration) -> Timestamp {
        if self.hwm.is_epoch() {
            return self.hwm;
        }
        if self.hwm == self.last_tick_hwm {
            self.hwm = self.hwm.add_duration(period);
        }
        self.last_tick_hwm = self.hwm;
        self.hwm
    }

    /// Definitions whose NextMRTS has been reached, in name order
    pub fn due_reports(&self) -> Vec<String> {
        self.next_mrts
            .iter()
            .filter(|(_, next)| **next <= self.hwm)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn next_report_time(&self, name: &str) -> Option<Timestamp> {
        self.next_mrts.get(name).copied()
    }

    pub fn last_generated(&self, name: &str) -> Option<Timestamp> {
        self.last_mrts.get(name).copied()
    }

    pub fn scheduled_count(&self) -> usize {
        self.next_mrts.len()
    }

    /// Due on the next tick
    pub fn schedule_now(&mut self, name: &str) {
        self.next_mrts.insert(name.to_string(), Timestamp::EPOCH);
    }

    pub fn schedule_at(&mut self, name: &str, at: Timestamp) {
        self.next_mrts.insert(name.to_string(), at);
    }

    pub fn unschedule(&mut self, name: &str) {
        self.next_mrts.remove(name);
    }

    /// Drop every trace of a definition
    pub fn forget(&mut self, name: &str) {
        self.next_mrts.remove(name);
        self.last_mrts.remove(name);
        self.pending_insert.remove(name);
    }

    pub fn mark_pending_insert(&mut self, name: &str) {
        self.pending_insert.insert(name.to_string());
    }

    pub fn is_pending_insert(&self, name: &str) -> bool {
        self.pending_insert.contains(name)
    }

    pub fn record_generated(&mut self, name: &str, hwm: Timestamp) {
        self.last_mrts.insert(name.to_string(), hwm);
        self.pending_insert.remove(name);
    }

    /// Debounced OnChange scheduling. An existing entry absorbs the change;
    /// otherwise the report is due no sooner than `min_interval` after its
    /// last generation. Returns true when a new entry was made.
    pub fn schedule_on_change(&mut self, name: &str, min_interval: Duration) -> bool {
        if self.next_mrts.contains_key(name) {
            return false;
        }
        let last = self.last_mrts.get(name).copied().unwrap_or(Timestamp::EPOCH);
        self.next_mrts.insert(name.to_string(), last.add_duration(min_interval));
        true
    }

    /// Queue a maintenance command. Repeated requests collapse.
    pub fn request_maintenance(&mut self, command: MaintenanceCommand) -> bool {
        self.maintenance.insert(command)
    }

    pub fn next_maintenance(&mut self) -> Option<MaintenanceCommand> {
        self.maintenance.pop_first()
    }

    pub fn pending_maintenance(&self) -> impl Iterator<Item = &MaintenanceCommand> + '_ {
        self.maintenance.iter()
    }
}

// ============================================================================
// SECTION 13: REPORT GENERATOR
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Outcomes & Notifications
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GenerationOutcome {
    Generated { report_name: String, sequence: i64 },
    /// Scheduled report had no rows; rolled back
    NothingToReport,
    /// Definition is disabled; its reports were removed
    Disabled,
}

/// Broadcast after every successful generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportGenerated {
    pub mrd_name: String,
    pub report_name: String,
}

/// A stored MetricReport row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricReportRow {
    pub id: i64,
    pub name: String,
    pub report_def_id: i64,
    pub sequence: i64,
    pub report_timestamp: Timestamp,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// One value row as a report shows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportValue {
    pub metric: String,
    pub context: String,
    pub label: String,
    pub timestamp: Timestamp,
    pub value: String,
}

// ----------------------------------------------------------------------------
// 13.2 Report Rows
// ----------------------------------------------------------------------------

const SELECT_REPORT_BY_NAME: &str = "
SELECT ID, Name, ReportDefinitionID, Sequence, ReportTimestamp, StartTimestamp, EndTimestamp
FROM MetricReport WHERE Name = ?1";

const UPSERT_REPORT: &str = "
INSERT INTO MetricReport
    (Name, ReportDefinitionID, Sequence, ReportTimestamp, StartTimestamp, EndTimestamp)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(Name) DO UPDATE SET
    ReportDefinitionID = excluded.ReportDefinitionID,
    Sequence = excluded.Sequence,
    ReportTimestamp = excluded.ReportTimestamp,
    StartTimestamp = excluded.StartTimestamp,
    EndTimestamp = excluded.EndTimestamp";

const ADVANCE_REPORT: &str = "
UPDATE MetricReport
SET Sequence = Sequence + 1, ReportTimestamp = ?2, StartTimestamp = ?3, EndTimestamp = ?4
WHERE ID = ?1";

const NEXT_GENERATION_SEQUENCE: &str = "
SELECT COALESCE(MAX(Sequence) + 1, 0) FROM MetricReport WHERE ReportDefinitionID = ?1";

const PRUNE_GENERATIONS: &str = "
DELETE FROM MetricReport
WHERE ReportDefinitionID = ?1
  AND ID NOT IN (
      SELECT ID FROM MetricReport WHERE ReportDefinitionID = ?1
      ORDER BY Sequence DESC, ID DESC LIMIT ?2)";

const SELECT_REPORT_VALUES: &str = "
SELECT MetricName, Context, Label, Timestamp, Value
FROM MetricValueByReport WHERE ReportName = ?1
ORDER BY Timestamp ASC, InstanceID ASC";

pub fn find_metric_report(conn: &Connection, name: &str) -> TelemetryResult<Option<MetricReportRow>> {
    Ok(conn
        .prepare_cached(SELECT_REPORT_BY_NAME)?
        .query_row([name], |row| {
            Ok(MetricReportRow {
                id: row.get(0)?,
                name: row.get(1)?,
                report_def_id: row.get(2)?,
                sequence: row.get(3)?,
                report_timestamp: Timestamp::from_nanos(row.get(4)?),
                start: Timestamp::from_nanos(row.get(5)?),
                end: Timestamp::from_nanos(row.get(6)?),
            })
        })
        .optional()?)
}

/// Report names for a definition, newest generation first
pub fn report_names_for_definition(conn: &Connection, report_def_id: i64) -> TelemetryResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT Name FROM MetricReport WHERE ReportDefinitionID = ?1 ORDER BY Sequence DESC, ID DESC",
    )?;
    let rows = stmt.query_map([report_def_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn report_value_count(conn: &Connection, report_name: &str) -> TelemetryResult<i64> {
    Ok(conn
        .prepare_cached("SELECT COUNT(*) FROM MetricValueByReport WHERE ReportName = ?1")?
        .query_row([report_name], |row| row.get(0))?)
}

pub fn report_values(conn: &Connection, report_name: &str) -> TelemetryResult<Vec<ReportValue>> {
    let mut stmt = conn.prepare_cached(SELECT_REPORT_VALUES)?;
    let rows = stmt.query_map([report_name], |row| {
        Ok(ReportValue {
            metric: row.get(0)?,
            context: row.get(1)?,
            label: row.get(2)?,
            timestamp: Timestamp::from_nanos(row.get(3)?),
            value: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn upsert_report(
    conn: &Connection,
    name: &str,
    report_def_id: i64,
    sequence: i64,
    hwm: Timestamp,
    start: Timestamp,
) -> TelemetryResult<()> {
    conn.prepare_cached(UPSERT_REPORT)?.execute(params![
        name,
        report_def_id,
        sequence,
        hwm.as_nanos(),
        start.as_nanos(),
        hwm.as_nanos(),
    ])?;
    Ok(())
}

// ----------------------------------------------------------------------------
// 13.3 Materialization
// ----------------------------------------------------------------------------

/// Write one generation of a report inside the caller's transaction.
///
/// Returns the report name and its new Sequence. A scheduled (non
/// OnRequest) report that ends up with no value rows fails with
/// [`TelemetryError::EmptyReport`] so the caller rolls everything back.
pub fn materialize_report(
    conn: &Connection,
    stored: &StoredReportDefinition,
    hwm: Timestamp,
    pending_insert: bool,
    settings: &ReportSettings,
) -> TelemetryResult<(String, i64)> {
    let mrd = &stored.definition;
    let fresh_start = hwm.sub_duration(mrd.window());

    let report_name = if mrd.report_updates == ReportUpdates::NewReport {
        let name = format!("{}-{}", mrd.name, hwm.to_rfc3339());
        let sequence: i64 = conn
            .prepare_cached(NEXT_GENERATION_SEQUENCE)?
            .query_row([stored.id], |row| row.get(0))?;
        upsert_report(conn, &name, stored.id, sequence, hwm, fresh_start)?;
        let pruned = conn
            .prepare_cached(PRUNE_GENERATIONS)?
            .execute(params![stored.id, settings.new_report_keep as i64])?;
        if pruned > 0 {
            debug!(target: "telemetry::generator", mrd = %mrd.name, pruned, "Old generations pruned");
        }
        name
    } else {
        let existing = if pending_insert {
            None
        } else {
            find_metric_report(conn, &mrd.name)?
        };
        match existing {
            None => upsert_report(conn, &mrd.name, stored.id, 0, hwm, fresh_start)?,
            Some(row) => {
                let start = match (mrd.report_updates, mrd.report_type) {
                    (ReportUpdates::Overwrite, ReportType::Periodic) if row.end < hwm => row.end,
                    (ReportUpdates::Overwrite, ReportType::Periodic) => row.start,
                    (ReportUpdates::Overwrite, _) => hwm.sub_duration(mrd.time_span),
                    _ => row.start,
                };
                conn.prepare_cached(ADVANCE_REPORT)?.execute(params![
                    row.id,
                    hwm.as_nanos(),
                    start.as_nanos(),
                    hwm.as_nanos(),
                ])?;
            }
        }
        mrd.name.clone()
    };

    if !mrd.suppress_dups {
        for mut instance in load_report_instances(conn, stored.id)? {
            let writes = instance.flush_at(hwm, settings.max_metric_expand_interval);
            persist_writes(conn, &instance, &writes)?;
        }
    }

    if mrd.report_type != ReportType::OnRequest && report_value_count(conn, &report_name)? == 0 {
        return Err(TelemetryError::EmptyReport { name: report_name });
    }

    let sequence: i64 = conn
        .prepare_cached("SELECT Sequence FROM MetricReport WHERE Name = ?1")?
        .query_row([&report_name], |row| row.get(0))?;
    Ok((report_name, sequence))
}

// ============================================================================
// SECTION 14: MAINTENANCE RUNNER
// ============================================================================
// Named batches of storage operations. One command runs per clock tick; each
// op gets its own transaction so a failure skips only that op.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Commands & Ops
// ----------------------------------------------------------------------------

/// Maintenance commands, queued in a dirty set and drained one per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceCommand {
    DeleteOrphans,
    CleanValues,
    Optimize,
    Vacuum,
}

impl MaintenanceCommand {
    pub const ALL: [MaintenanceCommand; 4] = [
        MaintenanceCommand::DeleteOrphans,
        MaintenanceCommand::CleanValues,
        MaintenanceCommand::Optimize,
        MaintenanceCommand::Vacuum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceCommand::DeleteOrphans => "delete orphans",
            MaintenanceCommand::CleanValues => "clean values",
            MaintenanceCommand::Optimize => "optimize",
            MaintenanceCommand::Vacuum => "vacuum",
        }
    }
}

impl Display for MaintenanceCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One storage operation. Op lists in [`MaintenanceConfig`] order them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceOp {
    /// Keep only the newest generations of NewReport definitions
    DeleteSurplusReports,
    TrimIntValues,
    TrimRealValues,
    TrimTextValues,
    DeleteOrphanValues,
    DeleteOrphanMeta,
    DeleteOrphanInstances,
    DeleteOrphanAssociations,
    Optimize,
    Shrink,
    /// Cannot run inside a transaction
    Vacuum,
}

const DELETE_SURPLUS_REPORTS: &str = "
DELETE FROM MetricReport WHERE ID IN (
    SELECT ID FROM (
        SELECT MR.ID AS ID,
               ROW_NUMBER() OVER (
                   PARTITION BY MR.ReportDefinitionID
                   ORDER BY MR.Sequence DESC, MR.ID DESC) AS Rank
        FROM MetricReport MR
        JOIN MetricReportDefinition MRD ON MRD.ID = MR.ReportDefinitionID
        WHERE MRD.Updates = 'NewReport')
    WHERE Rank > ?1)";

const TRIM_INT_VALUES: &str = "
DELETE FROM MetricValueInt WHERE rowid IN (
    SELECT rowid FROM MetricValueInt ORDER BY Timestamp DESC, rowid DESC LIMIT -1 OFFSET ?1)";

const TRIM_REAL_VALUES: &str = "
DELETE FROM MetricValueReal WHERE rowid IN (
    SELECT rowid FROM MetricValueReal ORDER BY Timestamp DESC, rowid DESC LIMIT -1 OFFSET ?1)";

const TRIM_TEXT_VALUES: &str = "
DELETE FROM MetricValueText WHERE rowid IN (
    SELECT rowid FROM MetricValueText ORDER BY Timestamp DESC, rowid DESC LIMIT -1 OFFSET ?1)";

const DELETE_ORPHAN_VALUES: [&str; 3] = [
    "DELETE FROM MetricValueInt WHERE InstanceID NOT IN (SELECT ID FROM MetricInstance)",
    "DELETE FROM MetricValueReal WHERE InstanceID NOT IN (SELECT ID FROM MetricInstance)",
    "DELETE FROM MetricValueText WHERE InstanceID NOT IN (SELECT ID FROM MetricInstance)",
];

const DELETE_ORPHAN_META: &str = "
DELETE FROM MetricMeta WHERE ID NOT IN (SELECT MetricMetaID FROM ReportDefinitionToMetricMeta)";

const DELETE_ORPHAN_INSTANCES: &str = "
DELETE FROM MetricInstance WHERE MetaID NOT IN (SELECT ID FROM MetricMeta)";

const DELETE_ORPHAN_ASSOCIATIONS: &str = "
DELETE FROM MetricMetaInstance
WHERE MetaID NOT IN (SELECT ID FROM MetricMeta)
   OR InstanceID NOT IN (SELECT ID FROM MetricInstance)";

impl MaintenanceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceOp::DeleteSurplusReports => "delete_surplus_reports",
            MaintenanceOp::TrimIntValues => "trim_int_values",
            MaintenanceOp::TrimRealValues => "trim_real_values",
            MaintenanceOp::TrimTextValues => "trim_text_values",
            MaintenanceOp::DeleteOrphanValues => "delete_orphan_values",
            MaintenanceOp::DeleteOrphanMeta => "delete_orphan_meta",
            MaintenanceOp::DeleteOrphanInstances => "delete_orphan_instances",
            MaintenanceOp::DeleteOrphanAssociations => "delete_orphan_associations",
            MaintenanceOp::Optimize => "optimize",
            MaintenanceOp::Shrink => "shrink",
            MaintenanceOp::Vacuum => "vacuum",
        }
    }

    /// Ops SQLite refuses to run inside a transaction
    pub fn needs_exclusive_connection(&self) -> bool {
        matches!(self, MaintenanceOp::Vacuum)
    }

    /// Run the op. Returns the number of rows removed.
    pub fn execute(&self, conn: &Connection, settings: &ReportSettings, value_cap: u64) -> TelemetryResult<usize> {
        let cap = i64::try_from(value_cap).unwrap_or(i64::MAX);
        let removed = match self {
            MaintenanceOp::DeleteSurplusReports => conn
                .prepare_cached(DELETE_SURPLUS_REPORTS)?
                .execute([settings.new_report_keep as i64])?,
            MaintenanceOp::TrimIntValues => conn.prepare_cached(TRIM_INT_VALUES)?.execute([cap])?,
            MaintenanceOp::TrimRealValues => conn.prepare_cached(TRIM_REAL_VALUES)?.execute([cap])?,
            MaintenanceOp::TrimTextValues => conn.prepare_cached(TRIM_TEXT_VALUES)?.execute([cap])?,
            MaintenanceOp::DeleteOrphanValues => {
                let mut removed = 0;
                for sql in DELETE_ORPHAN_VALUES {
                    removed += conn.prepare_cached(sql)?.execute([])?;
                }
                removed
            }
            MaintenanceOp::DeleteOrphanMeta => conn.prepare_cached(DELETE_ORPHAN_META)?.execute([])?,
            MaintenanceOp::DeleteOrphanInstances => conn.prepare_cached(DELETE_ORPHAN_INSTANCES)?.execute([])?,
            MaintenanceOp::DeleteOrphanAssociations => {
                conn.prepare_cached(DELETE_ORPHAN_ASSOCIATIONS)?.execute([])?
            }
            MaintenanceOp::Optimize => {
                conn.execute_batch("PRAGMA optimize;")?;
                0
            }
            MaintenanceOp::Shrink => {
                conn.execute_batch("PRAGMA shrink_memory;")?;
                0
            }
            MaintenanceOp::Vacuum => {
                conn.execute_batch("VACUUM;")?;
                0
            }
        };
        Ok(removed)
    }
}

impl Display for MaintenanceOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 14.2 Run Summary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub command: MaintenanceCommand,
    pub ops_run: usize,
    pub ops_failed: usize,
    pub rows_removed: usize,
}

// ============================================================================
// SECTION 15: TELEMETRY ENGINE
// ============================================================================
// Synchronous core. Every method runs on the event-loop task, which owns the
// database handle and the scheduler state.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Summaries
// ----------------------------------------------------------------------------

/// Result of one `StoreMetricValues` batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub samples: usize,
    /// Samples rolled back individually
    pub rejected: usize,
    pub updated_instances: usize,
    /// OnChange reports newly scheduled by this batch
    pub scheduled: usize,
}

/// Result of one clock tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub hwm: Timestamp,
    pub generated: usize,
    pub maintenance: Option<MaintenanceCommand>,
}

// ----------------------------------------------------------------------------
// 15.2 Engine State
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct TelemetryEngine {
    db: Database,
    scheduler: SchedulerState,
    patterns: PatternCache,
    settings: ReportSettings,
    limits: ReportLimits,
    maintenance: MaintenanceConfig,
    clock_period: Duration,
    drifting: bool,
    notifications: broadcast::Sender<ReportGenerated>,
}

impl TelemetryEngine {
    /// Build an engine over an opened database and resync the scheduler
    pub fn new(db: Database, config: &TelemetryConfig) -> TelemetryResult<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let mut engine = Self {
            db,
            scheduler: SchedulerState::new(),
            patterns: PatternCache::default(),
            settings: config.reports.clone(),
            limits: config.limits.clone(),
            maintenance: config.maintenance.clone(),
            clock_period: config.engine.clock_period,
            drifting: false,
            notifications,
        };
        engine.sync_from_store()?;
        Ok(engine)
    }

    /// In-memory engine with default configuration
    pub fn in_memory() -> TelemetryResult<Self> {
        Self::new(Database::open_in_memory()?, &TelemetryConfig::default())
    }

    pub fn scheduler(&self) -> &SchedulerState {
        &self.scheduler
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReportGenerated> {
        self.notifications.subscribe()
    }

    pub(crate) fn notifier(&self) -> broadcast::Sender<ReportGenerated> {
        self.notifications.clone()
    }

    /// Rebuild scheduler state from the store after a restart
    fn sync_from_store(&mut self) -> TelemetryResult<()> {
        let hwm: Option<i64> = self
            .db
            .conn()
            .query_row("SELECT MAX(Timestamp) FROM MetricValue", [], |row| row.get(0))?;
        if let Some(hwm) = hwm {
            self.scheduler.reset_hwm(Timestamp::from_nanos(hwm));
        }

        let mut scheduled = 0;
        for (name, report_type, enabled, reports) in load_schedule_state(self.db.conn())? {
            if !enabled {
                continue;
            }
            if report_type == ReportType::Periodic {
                self.scheduler.schedule_now(&name);
                scheduled += 1;
            }
            if reports == 0 {
                self.scheduler.mark_pending_insert(&name);
            }
        }

        info!(
            target: "telemetry::engine",
            hwm = %self.scheduler.hwm(),
            scheduled,
            "Scheduler state restored"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Report definitions
    // ------------------------------------------------------------------------

    fn normalize(&self, mrd: &mut MetricReportDefinition) {
        for change in validate_report_definition(mrd, &self.limits, self.settings.append_limit) {
            warn!(
                target: "telemetry::mrd",
                mrd = %mrd.name,
                field = change.field,
                from = %change.from,
                to = %change.to,
                "Report definition normalized"
            );
        }
    }

    pub fn add_report_definition(&mut self, mut mrd: MetricReportDefinition) -> TelemetryResult<String> {
        self.normalize(&mut mrd);
        let id = self.db.with_transaction(|conn| {
            let id = insert_report_definition(conn, &mrd)?;
            replace_metric_meta_links(conn, id, &mrd)?;
            Ok(id)
        })?;

        if mrd.enabled {
            self.scheduler.schedule_now(&mrd.name);
            self.scheduler.mark_pending_insert(&mrd.name);
        }
        info!(
            target: "telemetry::mrd",
            mrd = %mrd.name,
            id,
            report_type = %mrd.report_type,
            updates = %mrd.report_updates,
            enabled = mrd.enabled,
            "Report definition added"
        );
        Ok(mrd.uri())
    }

    /// Merge `patch` into the stored definition. The name cannot change.
    pub fn update_report_definition(&mut self, name: &str, patch: &JsonValue) -> TelemetryResult<String> {
        let stored = find_report_definition(self.db.conn(), name)?
            .ok_or_else(|| TelemetryError::not_found(ResourceKind::ReportDefinition, name))?;

        let mut document = serde_json::to_value(&stored.definition)?;
        json_merge_patch(&mut document, patch);
        let mut mrd: MetricReportDefinition = serde_json::from_value(document)?;
        mrd.name = stored.definition.name.clone();
        self.normalize(&mut mrd);

        self.db.with_transaction(|conn| {
            update_report_definition(conn, stored.id, &mrd)?;
            replace_metric_meta_links(conn, stored.id, &mrd)?;
            if !mrd.enabled {
                delete_reports_for_definition(conn, stored.id)?;
            }
            Ok(())
        })?;

        if mrd.enabled {
            self.scheduler.schedule_now(&mrd.name);
            self.scheduler.mark_pending_insert(&mrd.name);
        } else {
            self.scheduler.forget(&mrd.name);
        }
        self.scheduler.request_maintenance(MaintenanceCommand::DeleteOrphans);
        info!(target: "telemetry::mrd", mrd = %mrd.name, enabled = mrd.enabled, "Report definition updated");
        Ok(mrd.uri())
    }

    pub fn delete_report_definition(&mut self, name: &str) -> TelemetryResult<String> {
        self.db.with_transaction(|conn| delete_report_definition(conn, name))?;
        self.scheduler.forget(name);
        self.scheduler.request_maintenance(MaintenanceCommand::DeleteOrphans);
        info!(target: "telemetry::mrd", mrd = %name, "Report definition deleted");
        Ok(format!("{}/{}", MRD_COLLECTION_URI, name))
    }

    pub fn delete_metric_report(&mut self, name: &str) -> TelemetryResult<String> {
        self.db.with_transaction(|conn| delete_metric_report(conn, name))?;
        info!(target: "telemetry::report", report = %name, "Metric report deleted");
        Ok(format!("{}/{}", MR_COLLECTION_URI, name))
    }

    pub fn add_metric_definition(&mut self, md: &MetricDefinition) -> TelemetryResult<String> {
        let uri = self.db.with_transaction(|conn| insert_metric_definition(conn, md))?;
        debug!(target: "telemetry::registry", metric = %md.metric_id, "Metric definition added");
        Ok(uri)
    }

    pub fn create_trigger(&mut self, trigger: &TriggerDefinition) -> TelemetryResult<String> {
        let uri = self.db.with_transaction(|conn| insert_trigger(conn, trigger))?;
        debug!(target: "telemetry::registry", trigger = %trigger.name, "Trigger created");
        Ok(uri)
    }

    // ------------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------------

    /// Generate one report as of the current HWM
    pub fn generate_report(&mut self, name: &str) -> TelemetryResult<GenerationOutcome> {
        let hwm = self.scheduler.hwm();
        let Some(stored) = find_report_definition(self.db.conn(), name)? else {
            self.scheduler.forget(name);
            return Err(TelemetryError::not_found(ResourceKind::ReportDefinition, name));
        };

        // Reschedule first so a failing generation cannot spin every tick.
        match stored.definition.report_type {
            ReportType::Periodic if stored.definition.enabled => {
                self.scheduler
                    .schedule_at(name, hwm.add_duration(stored.definition.period()));
            }
            _ => self.scheduler.unschedule(name),
        }

        if !stored.definition.enabled {
            let removed = self
                .db
                .with_transaction(|conn| delete_reports_for_definition(conn, stored.id))?;
            debug!(target: "telemetry::generator", mrd = %name, removed, "Disabled definition, reports removed");
            return Ok(GenerationOutcome::Disabled);
        }

        let pending = self.scheduler.is_pending_insert(name);
        let settings = &self.settings;
        let result = self
            .db
            .with_transaction(|conn| materialize_report(conn, &stored, hwm, pending, settings));

        match result {
            Ok((report_name, sequence)) => {
                self.scheduler.record_generated(name, hwm);
                info!(
                    target: "telemetry::generator",
                    mrd = %name,
                    report = %report_name,
                    sequence,
                    hwm = %hwm,
                    "Report generated"
                );
                // No subscribers is fine.
                let _ = self.notifications.send(ReportGenerated {
                    mrd_name: name.to_string(),
                    report_name: report_name.clone(),
                });
                Ok(GenerationOutcome::Generated { report_name, sequence })
            }
            Err(TelemetryError::EmptyReport { name: report }) => {
                info!(target: "telemetry::generator", mrd = %name, report = %report, "Nothing to report");
                Ok(GenerationOutcome::NothingToReport)
            }
            Err(err) => {
                error!(
                    target: "telemetry::generator",
                    mrd = %name,
                    error = %err,
                    category = err.category(),
                    "Report generation failed"
                );
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Ingest a batch in one transaction, one savepoint per sample
    pub fn store_metric_values(&mut self, samples: &[MetricSample]) -> TelemetryResult<IngestSummary> {
        let mut summary = IngestSummary {
            samples: samples.len(),
            ..IngestSummary::default()
        };
        if samples.is_empty() {
            return Ok(summary);
        }

        for sample in samples {
            let hwm = self.scheduler.hwm();
            if !hwm.is_epoch() && sample.timestamp.abs_diff(hwm) > self.settings.max_metric_timestamp_delta {
                warn!(
                    target: "telemetry::ingest",
                    metric = %sample.name,
                    timestamp = %sample.timestamp,
                    hwm = %hwm,
                    "Sample timestamp far from the report clock"
                );
            }
        }

        let max_expand = self.settings.max_metric_expand_interval;
        let patterns = &mut self.patterns;
        let (updated, rejected, stored) = self.db.with_transaction(|conn| {
            let mut updated = BTreeSet::new();
            let mut rejected = 0;
            let mut stored = Vec::with_capacity(samples.len());
            for sample in samples {
                match with_savepoint(conn, |conn| ingest_sample(conn, patterns, sample, max_expand)) {
                    Ok(ids) => {
                        updated.extend(ids);
                        stored.push(sample.timestamp);
                    }
                    Err(err) if err.is_recoverable() => {
                        rejected += 1;
                        warn!(
                            target: "telemetry::ingest",
                            metric = %sample.name,
                            context = %sample.context,
                            error = %err,
                            "Sample rejected"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok((updated, rejected, stored))
        })?;

        // Only committed samples move the clock
        for ts in stored {
            self.scheduler.observe(ts);
        }
        summary.rejected = rejected;
        summary.updated_instances = updated.len();
        for instance_id in updated {
            for name in onchange_reports_for_instance(self.db.conn(), instance_id)? {
                if self
                    .scheduler
                    .schedule_on_change(&name, self.settings.smallest_report_interval)
                {
                    summary.scheduled += 1;
                    debug!(
                        target: "telemetry::scheduler",
                        mrd = %name,
                        at = ?self.scheduler.next_report_time(&name),
                        "OnChange report scheduled"
                    );
                }
            }
        }

        trace!(
            target: "telemetry::ingest",
            samples = summary.samples,
            rejected = summary.rejected,
            updated = summary.updated_instances,
            "Batch stored"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------------

    /// Handle one wall-clock tick at `now`
    pub fn tick(&mut self, now: Timestamp) -> TelemetryResult<TickSummary> {
        let mut summary = TickSummary::default();
        if self.scheduler.hwm().is_epoch() {
            trace!(target: "telemetry::scheduler", "No samples yet, clock idle");
        } else {
            summary.hwm = self.advance_report_clock(now);
            summary.generated = self.generate_due_reports()?;
        }

        if let Some(command) = self.scheduler.next_maintenance() {
            self.run_maintenance(command)?;
            summary.maintenance = Some(command);
        }
        Ok(summary)
    }

    /// Move the report clock and apply the drift guard
    fn advance_report_clock(&mut self, now: Timestamp) -> Timestamp {
        let mut hwm = self.scheduler.advance_clock(self.clock_period);
        let drift = now.abs_diff(hwm);
        if drift > self.settings.max_acceptable_drift {
            if !self.drifting {
                warn!(
                    target: "telemetry::scheduler",
                    drift = %humantime::format_duration(drift),
                    hwm = %hwm,
                    now = %now,
                    "Report clock drifting from wall clock"
                );
            }
            self.drifting = true;
            if self.settings.correct_drift {
                self.scheduler.reset_hwm(now);
                hwm = now;
            }
        } else if self.drifting {
            info!(target: "telemetry::scheduler", hwm = %hwm, "Report clock back in step");
            self.drifting = false;
        }
        hwm
    }

    /// Generate every due report. Recoverable failures were already logged.
    fn generate_due_reports(&mut self) -> TelemetryResult<usize> {
        let mut generated = 0;
        for name in self.scheduler.due_reports() {
            match self.generate_report(&name) {
                Ok(GenerationOutcome::Generated { .. }) => generated += 1,
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(generated)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    pub fn request_maintenance(&mut self, command: MaintenanceCommand) {
        if self.scheduler.request_maintenance(command) {
            debug!(target: "telemetry::maintenance", command = %command, "Maintenance queued");
        }
    }

    /// Run every op of `command`. Op failures are logged and skipped.
    pub fn run_maintenance(&mut self, command: MaintenanceCommand) -> TelemetryResult<MaintenanceSummary> {
        let started = Instant::now();
        let mut summary = MaintenanceSummary {
            command,
            ops_run: 0,
            ops_failed: 0,
            rows_removed: 0,
        };

        let ops = self.maintenance.ops_for(command).to_vec();
        let cap = self.maintenance.value_cap_per_lane;
        for op in ops {
            let settings = &self.settings;
            let result = if op.needs_exclusive_connection() {
                op.execute(self.db.conn(), settings, cap)
            } else {
                self.db.with_transaction(|conn| op.execute(conn, settings, cap))
            };
            match result {
                Ok(removed) => {
                    summary.ops_run += 1;
                    summary.rows_removed += removed;
                }
                Err(err) if err.is_recoverable() => {
                    summary.ops_failed += 1;
                    warn!(
                        target: "telemetry::maintenance",
                        command = %command,
                        op = %op,
                        error = %err,
                        "Maintenance op failed, skipped"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if command == MaintenanceCommand::DeleteOrphans {
            self.patterns.clear();
        }

        info!(
            target: "telemetry::maintenance",
            command = %command,
            ops = summary.ops_run,
            failed = summary.ops_failed,
            removed = summary.rows_removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Maintenance complete"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    /// Pre-rendered JSON document for a Redfish URI
    pub fn generic_get(&self, uri: &str) -> TelemetryResult<Option<Bytes>> {
        let uri = match uri.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let body: Option<String> = self
            .db
            .conn()
            .prepare_cached("SELECT Body FROM GenericGet WHERE URI = ?1")?
            .query_row([uri], |row| row.get(0))
            .optional()?;
        Ok(body.map(Bytes::from))
    }
}

// ============================================================================
// SECTION 16: COMMANDS, EVENTS & EVENT LOOP
// ============================================================================
// Callers talk to the engine through an mpsc channel of events. Commands carry
// a oneshot reply; every command type maps to exactly one response type.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Commands & Responses
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Command {
    AddMetricReportDefinition(MetricReportDefinition),
    UpdateMetricReportDefinition { name: String, patch: JsonValue },
    DeleteMetricReportDefinition { name: String },
    DeleteMetricReport { name: String },
    AddMetricDefinition(MetricDefinition),
    CreateTrigger(TriggerDefinition),
    GenerateReport { name: String },
    GenericGet { uri: String },
}

/// Response type paired with each command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    AddMetricReportDefinitionResponse,
    UpdateMetricReportDefinitionResponse,
    DeleteMetricReportDefinitionResponse,
    DeleteMetricReportResponse,
    AddMetricDefinitionResponse,
    CreateTriggerResponse,
    GenerateReportResponse,
    GenericGetResponse,
}

impl Command {
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::AddMetricReportDefinition(_) => ResponseKind::AddMetricReportDefinitionResponse,
            Command::UpdateMetricReportDefinition { .. } => ResponseKind::UpdateMetricReportDefinitionResponse,
            Command::DeleteMetricReportDefinition { .. } => ResponseKind::DeleteMetricReportDefinitionResponse,
            Command::DeleteMetricReport { .. } => ResponseKind::DeleteMetricReportResponse,
            Command::AddMetricDefinition(_) => ResponseKind::AddMetricDefinitionResponse,
            Command::CreateTrigger(_) => ResponseKind::CreateTriggerResponse,
            Command::GenerateReport { .. } => ResponseKind::GenerateReportResponse,
            Command::GenericGet { .. } => ResponseKind::GenericGetResponse,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::AddMetricReportDefinition(_) => "AddMetricReportDefinition",
            Command::UpdateMetricReportDefinition { .. } => "UpdateMetricReportDefinition",
            Command::DeleteMetricReportDefinition { .. } => "DeleteMetricReportDefinition",
            Command::DeleteMetricReport { .. } => "DeleteMetricReport",
            Command::AddMetricDefinition(_) => "AddMetricDefinition",
            Command::CreateTrigger(_) => "CreateTrigger",
            Command::GenerateReport { .. } => "GenerateReport",
            Command::GenericGet { .. } => "GenericGet",
        }
    }
}

/// Correlates a response with its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Created { uri: String },
    Updated { uri: String },
    Deleted { uri: String },
    Generated(GenerationOutcome),
    Document { status: u16, body: Bytes },
}

#[derive(Debug)]
pub struct CommandResponse {
    pub request_id: RequestId,
    pub kind: ResponseKind,
    pub result: TelemetryResult<CommandOutput>,
}

impl TelemetryEngine {
    /// Run a command to completion on the calling task
    pub fn execute(&mut self, command: Command) -> TelemetryResult<CommandOutput> {
        match command {
            Command::AddMetricReportDefinition(mrd) => {
                self.add_report_definition(mrd).map(|uri| CommandOutput::Created { uri })
            }
            Command::UpdateMetricReportDefinition { name, patch } => self
                .update_report_definition(&name, &patch)
                .map(|uri| CommandOutput::Updated { uri }),
            Command::DeleteMetricReportDefinition { name } => {
                self.delete_report_definition(&name).map(|uri| CommandOutput::Deleted { uri })
            }
            Command::DeleteMetricReport { name } => {
                self.delete_metric_report(&name).map(|uri| CommandOutput::Deleted { uri })
            }
            Command::AddMetricDefinition(md) => {
                self.add_metric_definition(&md).map(|uri| CommandOutput::Created { uri })
            }
            Command::CreateTrigger(trigger) => {
                self.create_trigger(&trigger).map(|uri| CommandOutput::Created { uri })
            }
            Command::GenerateReport { name } => self.generate_report(&name).map(CommandOutput::Generated),
            Command::GenericGet { uri } => Ok(match self.generic_get(&uri)? {
                Some(body) => CommandOutput::Document { status: 200, body },
                None => CommandOutput::Document {
                    status: 404,
                    body: Bytes::from(json!({ "error": format!("{} not found", uri) }).to_string()),
                },
            }),
        }
    }

    /// Dispatch one event. Only unrecoverable errors are returned; anything
    /// else is answered or logged.
    pub fn handle_event(&mut self, event: Event) -> TelemetryResult<()> {
        match event {
            Event::Command(envelope) => {
                let CommandEnvelope {
                    request_id,
                    command,
                    reply,
                } = envelope;
                let kind = command.response_kind();
                let name = command.name();
                let mut result = self.execute(command);

                let fatal = match &result {
                    Ok(_) => None,
                    Err(err) if err.is_critical() => {
                        error!(
                            target: "telemetry::engine",
                            request = %request_id,
                            command = name,
                            error = %err,
                            category = err.category(),
                            "Command failed"
                        );
                        (!err.is_recoverable()).then(|| err.to_string())
                    }
                    Err(err) => {
                        warn!(
                            target: "telemetry::engine",
                            request = %request_id,
                            command = name,
                            error = %err,
                            category = err.category(),
                            "Command rejected"
                        );
                        None
                    }
                };
                if let Some(message) = &fatal {
                    result = Err(TelemetryError::Unrecoverable(message.clone()));
                }

                if let Some(reply) = reply {
                    let response = CommandResponse {
                        request_id,
                        kind,
                        result,
                    };
                    if reply.send(response).is_err() {
                        debug!(target: "telemetry::engine", request = %request_id, "Caller went away before the response");
                    }
                }
                fatal.map_or(Ok(()), |message| Err(TelemetryError::Unrecoverable(message)))
            }
            Event::StoreMetricValues(samples) => match self.store_metric_values(&samples) {
                Ok(_) => Ok(()),
                Err(err) if err.is_recoverable() => {
                    error!(
                        target: "telemetry::ingest",
                        samples = samples.len(),
                        error = %err,
                        "Batch rolled back"
                    );
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Event::PublishClock => self.tick(Timestamp::now()).map(|_| ()),
            Event::DatabaseMaintenance(command) => {
                self.request_maintenance(command);
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 16.2 Events
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CommandEnvelope {
    pub request_id: RequestId,
    pub command: Command,
    /// `None` for fire-and-forget commands
    pub reply: Option<oneshot::Sender<CommandResponse>>,
}

#[derive(Debug)]
pub enum Event {
    Command(CommandEnvelope),
    StoreMetricValues(Vec<MetricSample>),
    PublishClock,
    DatabaseMaintenance(MaintenanceCommand),
}

// ----------------------------------------------------------------------------
// 16.3 Engine Handle
// ----------------------------------------------------------------------------

/// Cloneable front door to a running event loop
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<Event>,
    notifications: broadcast::Sender<ReportGenerated>,
    shutdown: Arc<Notify>,
}

/// Pending reply for a submitted command
#[derive(Debug)]
pub struct CommandTicket {
    pub request_id: RequestId,
    pub kind: ResponseKind,
    reply: oneshot::Receiver<CommandResponse>,
}

impl CommandTicket {
    pub async fn wait(self) -> TelemetryResult<CommandOutput> {
        match self.reply.await {
            Ok(response) => response.result,
            Err(_) => Err(TelemetryError::ShuttingDown),
        }
    }
}

impl EngineHandle {
    async fn send(&self, event: Event) -> TelemetryResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TelemetryError::ShuttingDown)
    }

    /// Queue a command and return a ticket for its response
    pub async fn submit(&self, command: Command) -> TelemetryResult<CommandTicket> {
        let request_id = RequestId::new();
        let kind = command.response_kind();
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(CommandEnvelope {
            request_id,
            command,
            reply: Some(tx),
        }))
        .await?;
        Ok(CommandTicket {
            request_id,
            kind,
            reply: rx,
        })
    }

    pub async fn execute(&self, command: Command) -> TelemetryResult<CommandOutput> {
        self.submit(command).await?.wait().await
    }

    pub async fn store_metric_values(&self, samples: Vec<MetricSample>) -> TelemetryResult<()> {
        self.send(Event::StoreMetricValues(samples)).await
    }

    pub async fn publish_clock(&self) -> TelemetryResult<()> {
        self.send(Event::PublishClock).await
    }

    pub async fn request_maintenance(&self, command: MaintenanceCommand) -> TelemetryResult<()> {
        self.send(Event::DatabaseMaintenance(command)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReportGenerated> {
        self.notifications.subscribe()
    }

    /// Ask the event loop to stop after the event in hand
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

// ----------------------------------------------------------------------------
// 16.4 Event Loop & Timers
// ----------------------------------------------------------------------------

/// Move the engine onto its own task. The task ends on shutdown, when every
/// handle is dropped, or on an unrecoverable error.
pub fn spawn_engine(
    engine: TelemetryEngine,
    queue_capacity: usize,
) -> (EngineHandle, TokioJoinHandle<TelemetryResult<()>>) {
    let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
    let shutdown = Arc::new(Notify::new());
    let handle = EngineHandle {
        events: events_tx,
        notifications: engine.notifier(),
        shutdown: Arc::clone(&shutdown),
    };
    let task = tokio::spawn(run_event_loop(engine, events_rx, shutdown));
    (handle, task)
}

pub async fn run_event_loop(
    mut engine: TelemetryEngine,
    mut events: mpsc::Receiver<Event>,
    shutdown: Arc<Notify>,
) -> TelemetryResult<()> {
    info!(target: "telemetry::engine", "Event loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                info!(target: "telemetry::engine", "Shutdown requested");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    info!(target: "telemetry::engine", "All handles dropped");
                    break;
                };
                if let Err(err) = engine.handle_event(event) {
                    error!(
                        target: "telemetry::engine",
                        error = %err,
                        category = err.category(),
                        "Unrecoverable error, stopping event loop"
                    );
                    return Err(err);
                }
            }
        }
    }
    info!(target: "telemetry::engine", hwm = %engine.scheduler().hwm(), "Event loop stopped");
    Ok(())
}

/// Clock tick plus the staggered maintenance timers
pub fn spawn_timers(
    handle: EngineHandle,
    clock_period: Duration,
    maintenance: &MaintenanceConfig,
) -> TokioJoinHandle<()> {
    let clean_every = maintenance.clean_values_interval;
    let vacuum_every = maintenance.vacuum_interval;
    let optimize_every = maintenance.optimize_interval;

    tokio::spawn(async move {
        let mut clock = interval(clock_period);
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut clean = interval(clean_every);
        let mut vacuum = interval(vacuum_every);
        let mut optimize = interval(optimize_every);
        // The first tick of an interval fires immediately.
        clean.tick().await;
        vacuum.tick().await;
        optimize.tick().await;

        loop {
            let sent = tokio::select! {
                _ = clock.tick() => handle.publish_clock().await,
                _ = clean.tick() => handle.request_maintenance(MaintenanceCommand::CleanValues).await,
                _ = vacuum.tick() => handle.request_maintenance(MaintenanceCommand::Vacuum).await,
                _ = optimize.tick() => {
                    match handle.request_maintenance(MaintenanceCommand::Optimize).await {
                        Ok(()) => handle.request_maintenance(MaintenanceCommand::DeleteOrphans).await,
                        Err(err) => Err(err),
                    }
                }
            };
            if sent.is_err() {
                debug!(target: "telemetry::timers", "Event loop gone, timers stopping");
                break;
            }
        }
    })
}

// ============================================================================
// SECTION 17: CLI & SERVICE
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Telemetry Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "telemetry-engine",
    author = "Telemetry Team",
    version,
    about = "Metric report engine for BMC telemetry",
    long_about = "Ingests metric samples into an embedded SQLite store and generates \
                  Redfish metric reports from Metric Report Definitions, driven by a \
                  clock derived from the sample stream."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "telemetry.toml", env = "TELEMETRY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "TELEMETRY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "TELEMETRY_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine
    Run {
        /// Database file, overriding the configuration
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 17.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> TelemetryResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match TelemetryConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nSummary:");
            println!("  • Database: {}", config.engine.database_path.display());
            println!("  • Clock period: {}", humantime::format_duration(config.engine.clock_period));
            println!("  • Append limit: {}", config.reports.append_limit);
            println!(
                "  • Period bounds: {} .. {}",
                humantime::format_duration(config.limits.min_period),
                humantime::format_duration(config.limits.max_period)
            );
            println!("  • Values kept per lane: {}", config.maintenance.value_cap_per_lane);
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(TelemetryError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> TelemetryResult<()> {
    let config_str = TelemetryConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Schema version: {}", SCHEMA_VERSION);
    println!("  • SQLite: {}", rusqlite::version());
    println!();
    println!("Report types: Periodic, OnChange, OnRequest");
    println!("Update policies: Overwrite, NewReport, AppendStopsWhenFull, AppendWrapsWhenFull");
}

// ----------------------------------------------------------------------------
// 17.3 Service Runner
// ----------------------------------------------------------------------------

#[cfg(unix)]
async fn wait_for_signal() -> TelemetryResult<&'static str> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> TelemetryResult<&'static str> {
    signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Open the store, run the event loop and timers until a signal arrives
pub async fn run_service(config: TelemetryConfig) -> TelemetryResult<()> {
    let db = Database::open(&config.engine.database_path)?;
    let engine = TelemetryEngine::new(db, &config)?;
    let (handle, mut event_loop) = spawn_engine(engine, config.engine.event_queue_capacity);
    let timers = spawn_timers(handle.clone(), config.engine.clock_period, &config.maintenance);

    let mut notifications = handle.subscribe();
    let listener = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(generated) => debug!(
                    target: "telemetry::service",
                    mrd = %generated.mrd_name,
                    report = %generated.report_name,
                    "ReportGenerated"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "telemetry::service", skipped, "Notification listener lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(
        target: "telemetry::service",
        database = %config.engine.database_path.display(),
        clock = %humantime::format_duration(config.engine.clock_period),
        "Telemetry engine running"
    );

    let finished = tokio::select! {
        received = wait_for_signal() => {
            let signal = received?;
            info!(target: "telemetry::service", signal, "Signal received");
            None
        }
        joined = &mut event_loop => Some(joined),
    };

    timers.abort();
    let started = Instant::now();
    let joined = match finished {
        Some(joined) => joined,
        None => {
            handle.shutdown();
            match tokio::time::timeout(config.engine.shutdown_timeout, event_loop).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(target: "telemetry::service", "Event loop did not stop in time");
                    listener.abort();
                    return Ok(());
                }
            }
        }
    };
    listener.abort();

    let result = joined.map_err(|e| TelemetryError::Internal(format!("event loop task failed: {}", e)))?;
    info!(
        target: "telemetry::service",
        duration_ms = started.elapsed().as_millis() as u64,
        "Shutdown complete"
    );
    result
}

// ============================================================================
// SECTION 18: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let mut config = if config_missing {
        TelemetryConfig::default()
    } else {
        TelemetryConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    init_logging(&config.logging)?;
    if config_missing {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    if let Some(Commands::Run { database: Some(path) }) = &cli.command {
        config.engine.database_path = path.clone();
    }
    run_service(config).await?;
    Ok(())
}

// ============================================================================
// SECTION 19: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn meta(name: &str, property: &str, wildcards: &[(&str, &[&str])]) -> MetricMeta {
        MetricMeta {
            id: 1,
            name_pattern: name.to_string(),
            fqdd_pattern: String::new(),
            source_pattern: String::new(),
            property_pattern: property.to_string(),
            wildcards: wildcards
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            collection_function: None,
            collection_duration: Duration::ZERO,
            suppress_dups: false,
        }
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t0 = Timestamp::from_secs(1_700_000_000);
        let later = t0.add_duration(secs(90));

        assert_eq!(later.nanos_since(t0), 90_000_000_000);
        assert_eq!(later.sub_duration(secs(90)), t0);
        assert_eq!(t0.abs_diff(later), secs(90));
        assert!(Timestamp::EPOCH.is_epoch());
        assert_eq!(t0.to_rfc3339(), "2023-11-14T22:13:20Z");
    }

    #[rstest]
    #[case("PT60S", 60_000)]
    #[case("PT5M", 300_000)]
    #[case("P1DT1H", 90_000_000)]
    #[case("PT1.5S", 1_500)]
    #[case("-PT5S", 0)]
    #[case("PT99999999999999999999S", MAX_REDFISH_DURATION.as_millis() as u64)]
    #[case("P999999999999999999D", MAX_REDFISH_DURATION.as_millis() as u64)]
    #[case("P99999999999999DT9999999999999H", MAX_REDFISH_DURATION.as_millis() as u64)]
    fn test_redfish_duration_parse(#[case] text: &str, #[case] millis: u64) {
        assert_eq!(parse_redfish_duration(text).unwrap().as_millis(), u128::from(millis));
    }

    #[test]
    fn test_redfish_duration_rejects_garbage() {
        assert!(parse_redfish_duration("five minutes").is_err());
        assert!(parse_redfish_duration("60").is_err());
        assert_eq!(format_redfish_duration(secs(60)), "PT60S");
    }

    #[test]
    fn test_lane_classification() {
        assert_eq!(LaneValue::classify("42"), LaneValue::Int(42));
        assert_eq!(LaneValue::classify("-3.5"), LaneValue::Real(-3.5));
        assert_eq!(LaneValue::classify("NaN"), LaneValue::Text("NaN".into()));
        assert_eq!(LaneValue::classify("Enabled"), LaneValue::Text("Enabled".into()));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TelemetryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reports.append_limit, 24_000);
        assert_eq!(config.limits.default_period, secs(300));
        assert_eq!(config.maintenance.optimize_interval, secs(10_831));
        assert_eq!(
            config.maintenance.ops_for(MaintenanceCommand::Vacuum),
            &[MaintenanceOp::Vacuum, MaintenanceOp::Shrink]
        );
    }

    #[test]
    fn test_config_from_toml() {
        let config = TelemetryConfig::parse_toml(
            r#"
            [reports]
            append_limit = 100
            correct_drift = true

            [limits]
            min_period = "10s"

            [maintenance]
            optimize_ops = ["optimize"]
            "#,
        )
        .unwrap();

        assert_eq!(config.reports.append_limit, 100);
        assert!(config.reports.correct_drift);
        assert_eq!(config.limits.min_period, secs(10));
        assert_eq!(config.limits.max_period, MAX_PERIOD);
        assert_eq!(config.maintenance.optimize_ops, vec![MaintenanceOp::Optimize]);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let err = TelemetryConfig::parse_toml("[engine]\nevent_queue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "engine.event_queue_capacity"));

        let err = TelemetryConfig::parse_toml("[limits]\nmin_period = \"3h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = TelemetryConfig::generate_default_config();
        let parsed = TelemetryConfig::parse_toml(&rendered).unwrap();
        assert_eq!(parsed, TelemetryConfig::default());
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.toml");
        fs::write(&path, "[engine]\ndatabase_path = \"/var/lib/telemetry.db\"\n").unwrap();

        let config = TelemetryConfig::load(&path).unwrap();
        assert_eq!(config.engine.database_path, PathBuf::from("/var/lib/telemetry.db"));

        let missing = TelemetryConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_error_classification() {
        let not_found = TelemetryError::not_found(ResourceKind::ReportDefinition, "PowerUsage");
        assert!(not_found.is_recoverable());
        assert_eq!(not_found.category(), "not_found");
        assert_eq!(not_found.to_string(), "MetricReportDefinition not found: PowerUsage");

        assert!(!not_found.is_critical());
        assert!(!TelemetryError::InvalidRequest("bad patch".into()).is_critical());

        let storage = TelemetryError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(storage.is_recoverable());
        assert!(storage.is_critical());

        let fatal = TelemetryError::Unrecoverable("commit failed".into());
        assert!(!fatal.is_recoverable());
        assert!(fatal.is_critical());
    }

    #[test]
    fn test_mrd_from_redfish_json() {
        let mrd: MetricReportDefinition = serde_json::from_str(
            r#"{
                "Id": "PowerMetrics",
                "MetricReportDefinitionType": "Periodic",
                "ReportUpdates": "Overwrite",
                "Schedule": { "RecurrenceInterval": "PT60S" },
                "MetricReportDefinitionEnabled": true,
                "Metrics": [{
                    "MetricId": "Watts",
                    "CollectionFunction": "Average",
                    "CollectionDuration": "PT30S",
                    "Oem": { "Dell": { "FQDD": "PSU.Slot.*" } }
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(mrd.name, "PowerMetrics");
        assert_eq!(mrd.report_type, ReportType::Periodic);
        assert_eq!(mrd.period(), secs(60));
        assert_eq!(mrd.time_span, Duration::ZERO);
        assert!(mrd.enabled);
        assert_eq!(mrd.metrics[0].collection_function, Some(CollectionFunction::Average));
        assert_eq!(mrd.metrics[0].collection_duration, secs(30));
        assert_eq!(mrd.metrics[0].oem.dell.fqdd, "PSU.Slot.*");

        let odd: MetricReportDefinition =
            serde_json::from_str(r#"{"Id": "Odd", "MetricReportDefinitionType": "Sometimes"}"#).unwrap();
        assert_eq!(odd.report_type, ReportType::Unrecognized);
    }

    #[rstest]
    #[case::periodic_default_period(ReportType::Periodic, ReportUpdates::Overwrite, 0, 0, ReportType::Periodic, ReportUpdates::Overwrite, 300, 0)]
    #[case::periodic_period_floor(ReportType::Periodic, ReportUpdates::NewReport, 1, 0, ReportType::Periodic, ReportUpdates::NewReport, 5, 0)]
    #[case::periodic_period_ceiling(ReportType::Periodic, ReportUpdates::Overwrite, 3 * 3600, 0, ReportType::Periodic, ReportUpdates::Overwrite, 7200, 0)]
    #[case::periodic_bad_updates(ReportType::Periodic, ReportUpdates::Unrecognized, 60, 0, ReportType::Periodic, ReportUpdates::Overwrite, 60, 0)]
    #[case::periodic_append_needs_span(ReportType::Periodic, ReportUpdates::AppendWrapsWhenFull, 60, 0, ReportType::Periodic, ReportUpdates::AppendWrapsWhenFull, 60, 4 * 3600)]
    #[case::onchange_span_floor(ReportType::OnChange, ReportUpdates::Overwrite, 60, 10, ReportType::OnChange, ReportUpdates::Overwrite, 0, 60)]
    #[case::onchange_span_default(ReportType::OnChange, ReportUpdates::Unrecognized, 0, 0, ReportType::OnChange, ReportUpdates::Overwrite, 0, 4 * 3600)]
    #[case::onrequest_forced_wrap(ReportType::OnRequest, ReportUpdates::Overwrite, 30, 5 * 3600, ReportType::OnRequest, ReportUpdates::AppendWrapsWhenFull, 0, 4 * 3600)]
    #[case::unknown_type(ReportType::Unrecognized, ReportUpdates::NewReport, 60, 120, ReportType::OnRequest, ReportUpdates::AppendWrapsWhenFull, 0, 4 * 3600)]
    #[allow(clippy::too_many_arguments)]
    fn test_normalization_matrix(
        #[case] report_type: ReportType,
        #[case] updates: ReportUpdates,
        #[case] period: u64,
        #[case] span: u64,
        #[case] want_type: ReportType,
        #[case] want_updates: ReportUpdates,
        #[case] want_period: u64,
        #[case] want_span: u64,
    ) {
        let mut mrd = MetricReportDefinition::new("M", report_type, updates)
            .with_period(secs(period))
            .with_time_span(secs(span));
        validate_report_definition(&mut mrd, &ReportLimits::default(), DEFAULT_APPEND_LIMIT);

        assert_eq!(mrd.report_type, want_type);
        assert_eq!(mrd.report_updates, want_updates);
        assert_eq!(mrd.period(), secs(want_period));
        assert_eq!(mrd.time_span, secs(want_span));
        assert_eq!(mrd.append_limit, DEFAULT_APPEND_LIMIT);
    }

    #[test]
    fn test_unknown_type_is_disabled_and_reported() {
        let mut mrd = MetricReportDefinition::new("M", ReportType::Unrecognized, ReportUpdates::Overwrite);
        let changes = validate_report_definition(&mut mrd, &ReportLimits::default(), 10);

        assert!(!mrd.enabled);
        assert!(mrd.report_actions.is_empty());
        let fields: Vec<&str> = changes.iter().map(|c| c.field).collect();
        assert!(fields.contains(&"MetricReportDefinitionType"));
        assert!(fields.contains(&"MetricReportDefinitionEnabled"));
        assert!(fields.contains(&"AppendLimit"));
    }

    #[test]
    fn test_overlong_durations_are_clamped() {
        let mut mrd: MetricReportDefinition = serde_json::from_str(
            r#"{
                "Id": "Huge",
                "MetricReportDefinitionType": "Periodic",
                "ReportUpdates": "AppendWrapsWhenFull",
                "ReportTimespan": "P999999999999999999D",
                "Schedule": { "RecurrenceInterval": "PT99999999999999999999S" }
            }"#,
        )
        .unwrap();
        assert_eq!(mrd.time_span, MAX_REDFISH_DURATION);

        validate_report_definition(&mut mrd, &ReportLimits::default(), DEFAULT_APPEND_LIMIT);
        assert_eq!(mrd.period(), MAX_PERIOD);
        assert_eq!(mrd.time_span, MAX_TIME_SPAN);
    }

    #[test]
    fn test_valid_definition_is_untouched() {
        let mut mrd = MetricReportDefinition::new("M", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60));
        mrd.append_limit = 50;
        assert!(validate_report_definition(&mut mrd, &ReportLimits::default(), 10).is_empty());
    }

    #[test]
    fn test_json_merge_patch() {
        let mut doc = serde_json::json!({ "a": 1, "b": { "c": 2, "keep": true } });
        json_merge_patch(&mut doc, &serde_json::json!({ "b": { "c": null, "d": 3 }, "e": [1, 2] }));
        assert_eq!(doc, serde_json::json!({ "a": 1, "b": { "keep": true, "d": 3 }, "e": [1, 2] }));
    }

    #[test]
    fn test_metric_metas_expand_properties() {
        let mut mrd = MetricReportDefinition::new("M", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_metric(
                MetricRule::new("Temp*")
                    .with_property("/redfish/v1/Chassis/{ChassisId}/Thermal")
                    .with_property("/redfish/v1/Chassis/{ChassisId}/Power"),
            )
            .with_metric(MetricRule::new("Watts").aggregated(CollectionFunction::Maximum, secs(60)));
        mrd.wildcards.push(Wildcard {
            name: "ChassisId".into(),
            values: vec!["System.Embedded.1".into()],
        });
        mrd.suppress_dups = true;

        let metas = mrd.metric_metas();
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].wildcards["ChassisId"], vec!["System.Embedded.1".to_string()]);
        assert_eq!(metas[2].property_pattern, "");
        assert_eq!(metas[2].collection_function, Some(CollectionFunction::Maximum));
        assert!(metas.iter().all(|m| m.suppress_dups));
    }

    #[test]
    fn test_name_and_property_patterns() {
        let sample = MetricSample::new("TemperatureReading", "40", Timestamp::from_secs(1))
            .with_property("/redfish/v1/Chassis/System.Embedded.1/Thermal");

        let by_glob = MetaPattern::compile(&meta("Temperature*", "", &[])).unwrap();
        assert!(by_glob.matches(&sample));

        let restricted = MetaPattern::compile(&meta(
            "*",
            "/redfish/v1/Chassis/{ChassisId}/Thermal",
            &[("ChassisId", &["System.Embedded.1"])],
        ))
        .unwrap();
        assert!(restricted.matches(&sample));
        assert!(!restricted.matches(&sample.clone().with_property("/redfish/v1/Chassis/Enclosure.1/Thermal")));

        let open = MetaPattern::compile(&meta("*", "/redfish/v1/Chassis/{ChassisId}/Thermal", &[])).unwrap();
        assert!(open.matches(&sample.clone().with_property("/redfish/v1/Chassis/Enclosure.1/Thermal")));
        assert!(!open.matches(&sample.clone().with_property("/redfish/v1/Chassis/a/b/Thermal")));

        let other = MetaPattern::compile(&meta("Watts", "", &[])).unwrap();
        assert!(!other.matches(&sample));
    }

    #[test]
    fn test_instance_label() {
        let sample = MetricSample::new("Watts", "1", Timestamp::from_secs(1)).with_context("PSU1");
        let mut meta = meta("Watts", "", &[]);
        assert_eq!(meta.instance_label(&sample), "PSU1 Watts");

        meta.collection_function = Some(CollectionFunction::Average);
        meta.collection_duration = secs(60);
        assert_eq!(meta.instance_label(&sample), "PSU1 Watts - Average (1m)");
    }
}

// ============================================================================
// SECTION 20: AGGREGATION & SCHEDULER TESTS
// ============================================================================


// ============================================================================
// SECTION 21: ENGINE TESTS
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000;

    fn at(offset: i64) -> Timestamp {
        Timestamp::from_secs(T0 + offset)
    }

    fn at_millis(millis: i64) -> Timestamp {
        Timestamp::from_nanos(T0 * 1_000_000_000 + millis * 1_000_000)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn watts(value: &str, ts: Timestamp) -> MetricSample {
        MetricSample::new("Watts", value, ts).with_context("PSU1")
    }

    fn volts(value: &str, ts: Timestamp) -> MetricSample {
        MetricSample::new("Volts", value, ts).with_context("PSU1")
    }

    fn power_usage() -> MetricReportDefinition {
        MetricReportDefinition::new("PowerUsage", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60))
            .with_metric(MetricRule::new("Watts"))
    }

    /// Tick with the wall clock pinned to the report clock
    fn tick(engine: &mut TelemetryEngine) -> TickSummary {
        let now = engine.scheduler().hwm();
        engine.tick(now).unwrap()
    }

    fn count(engine: &TelemetryEngine, sql: &str) -> i64 {
        engine.database().conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn values(engine: &TelemetryEngine, report: &str) -> Vec<String> {
        report_values(engine.database().conn(), report)
            .unwrap()
            .into_iter()
            .map(|v| v.value)
            .collect()
    }

    fn document(engine: &TelemetryEngine, uri: &str) -> JsonValue {
        let body = engine.generic_get(uri).unwrap().expect("document exists");
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_periodic_overwrite_report() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mut notifications = engine.subscribe();
        engine.add_report_definition(power_usage()).unwrap();

        let stored = engine.store_metric_values(&[watts("100", at(0))]).unwrap();
        assert_eq!(stored.updated_instances, 1);
        assert_eq!(stored.rejected, 0);

        assert_eq!(tick(&mut engine).generated, 1);
        let first = find_metric_report(engine.database().conn(), "PowerUsage").unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(
            notifications.try_recv().unwrap(),
            ReportGenerated {
                mrd_name: "PowerUsage".into(),
                report_name: "PowerUsage".into(),
            }
        );

        let generated: usize = (0..60).map(|_| tick(&mut engine).generated).sum();
        assert_eq!(generated, 1);

        let report = find_metric_report(engine.database().conn(), "PowerUsage").unwrap().unwrap();
        assert_eq!(report.sequence, 1);
        assert_eq!(report.start, at(0));
        assert_eq!(report.end, at(60));
        assert_eq!(values(&engine, "PowerUsage"), vec!["100".to_string()]);
        assert_eq!(engine.scheduler().next_report_time("PowerUsage"), Some(at(120)));
    }

    #[test]
    fn test_explicit_generation_is_repeatable() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Snapshot", ReportType::OnChange, ReportUpdates::Overwrite)
            .with_time_span(secs(120))
            .with_metric(MetricRule::new("Watts"));
        engine.add_report_definition(mrd).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();

        let mut sequences = Vec::new();
        let mut snapshots = Vec::new();
        for _ in 0..3 {
            match engine.generate_report("Snapshot").unwrap() {
                GenerationOutcome::Generated { report_name, sequence } => {
                    sequences.push(sequence);
                    snapshots.push(values(&engine, &report_name));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[1], snapshots[2]);
    }

    #[test]
    fn test_on_change_reports_are_debounced() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Events", ReportType::OnChange, ReportUpdates::AppendWrapsWhenFull)
            .with_time_span(secs(300))
            .with_suppress_dups(true)
            .with_metric(MetricRule::new("Watts"));
        engine.add_report_definition(mrd).unwrap();

        engine.store_metric_values(&[watts("40", at(0))]).unwrap();
        assert_eq!(tick(&mut engine).generated, 1);

        let mut scheduled = 0;
        for (value, ts) in [("50", at_millis(1000)), ("50", at_millis(1400)), ("60", at_millis(1800))] {
            scheduled += engine.store_metric_values(&[watts(value, ts)]).unwrap().scheduled;
        }
        assert_eq!(scheduled, 1);
        assert_eq!(engine.scheduler().next_report_time("Events"), Some(at(5)));

        let generated: usize = (0..10).map(|_| tick(&mut engine).generated).sum();
        assert_eq!(generated, 1);
        assert_eq!(engine.scheduler().last_generated("Events"), Some(at_millis(5800)));

        let report = find_metric_report(engine.database().conn(), "Events").unwrap().unwrap();
        assert_eq!(report.sequence, 1);
        assert_eq!(values(&engine, "Events"), vec!["40", "50", "60"]);
    }

    #[test]
    fn test_empty_scheduled_report_is_rolled_back() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("VoltageUsage", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60))
            .with_metric(MetricRule::new("Volts"));
        engine.add_report_definition(mrd).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();

        assert_eq!(engine.generate_report("VoltageUsage").unwrap(), GenerationOutcome::NothingToReport);
        assert!(find_metric_report(engine.database().conn(), "VoltageUsage").unwrap().is_none());
        assert_eq!(engine.scheduler().next_report_time("VoltageUsage"), Some(at(60)));
    }

    #[test]
    fn test_on_request_report_may_be_empty() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("OnDemand", ReportType::OnRequest, ReportUpdates::Overwrite)
            .with_metric(MetricRule::new("Volts"));
        engine.add_report_definition(mrd).unwrap();

        let outcome = engine.generate_report("OnDemand").unwrap();
        assert_eq!(
            outcome,
            GenerationOutcome::Generated {
                report_name: "OnDemand".into(),
                sequence: 0,
            }
        );
        assert_eq!(report_value_count(engine.database().conn(), "OnDemand").unwrap(), 0);
    }

    #[test]
    fn test_disabled_definition_is_not_generated() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mut mrd = power_usage();
        mrd.enabled = false;
        engine.add_report_definition(mrd).unwrap();

        assert_eq!(engine.scheduler().scheduled_count(), 0);
        assert_eq!(engine.generate_report("PowerUsage").unwrap(), GenerationOutcome::Disabled);
    }

    #[test]
    fn test_disabling_removes_reports() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();
        tick(&mut engine);
        assert!(find_metric_report(engine.database().conn(), "PowerUsage").unwrap().is_some());

        engine
            .update_report_definition("PowerUsage", &serde_json::json!({ "MetricReportDefinitionEnabled": false }))
            .unwrap();

        assert!(find_metric_report(engine.database().conn(), "PowerUsage").unwrap().is_none());
        assert_eq!(engine.scheduler().next_report_time("PowerUsage"), None);
    }

    #[test]
    fn test_update_applies_merge_patch() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();

        let uri = engine
            .update_report_definition(
                "PowerUsage",
                &serde_json::json!({ "Id": "Renamed", "Schedule": { "RecurrenceInterval": "PT120S" } }),
            )
            .unwrap();
        assert_eq!(uri, format!("{}/PowerUsage", MRD_COLLECTION_URI));

        let stored = find_report_definition(engine.database().conn(), "PowerUsage").unwrap().unwrap();
        assert_eq!(stored.definition.period(), secs(120));
        assert_eq!(stored.definition.metrics, vec![MetricRule::new("Watts")]);
        assert!(engine.scheduler().is_pending_insert("PowerUsage"));
        assert_eq!(
            engine.scheduler().pending_maintenance().copied().collect::<Vec<_>>(),
            vec![MaintenanceCommand::DeleteOrphans]
        );
    }

    #[test]
    fn test_definition_crud_errors() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();

        let duplicate = engine.add_report_definition(power_usage()).unwrap_err();
        assert!(matches!(duplicate, TelemetryError::AlreadyExists { kind: ResourceKind::ReportDefinition, .. }));

        let missing = engine
            .update_report_definition("Nope", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(missing, TelemetryError::NotFound { .. }));

        assert!(matches!(
            engine.delete_report_definition("Nope").unwrap_err(),
            TelemetryError::NotFound { .. }
        ));
        assert!(matches!(
            engine.generate_report("Nope").unwrap_err(),
            TelemetryError::NotFound { .. }
        ));

        engine.delete_report_definition("PowerUsage").unwrap();
        assert_eq!(engine.scheduler().scheduled_count(), 0);
        assert!(find_report_definition(engine.database().conn(), "PowerUsage").unwrap().is_none());
    }

    #[test]
    fn test_new_report_keeps_recent_generations() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Gens", ReportType::Periodic, ReportUpdates::NewReport)
            .with_period(secs(60))
            .with_metric(MetricRule::new("Watts"));
        engine.add_report_definition(mrd).unwrap();

        let mut last = None;
        for i in 0..5 {
            engine.store_metric_values(&[watts("100", at(i * 60))]).unwrap();
            last = Some(engine.generate_report("Gens").unwrap());
        }
        assert_eq!(
            last,
            Some(GenerationOutcome::Generated {
                report_name: "Gens-2023-11-14T22:17:20Z".into(),
                sequence: 4,
            })
        );

        let stored = find_report_definition(engine.database().conn(), "Gens").unwrap().unwrap();
        let names = report_names_for_definition(engine.database().conn(), stored.id).unwrap();
        assert_eq!(
            names,
            vec![
                "Gens-2023-11-14T22:17:20Z".to_string(),
                "Gens-2023-11-14T22:16:20Z".to_string(),
                "Gens-2023-11-14T22:15:20Z".to_string(),
            ]
        );
    }

    #[test]
    fn test_append_limit_truncation() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        for (name, updates) in [
            ("Stops", ReportUpdates::AppendStopsWhenFull),
            ("Wraps", ReportUpdates::AppendWrapsWhenFull),
        ] {
            let mut mrd = MetricReportDefinition::new(name, ReportType::Periodic, updates)
                .with_period(secs(60))
                .with_metric(MetricRule::new("Watts"));
            mrd.append_limit = 3;
            engine.add_report_definition(mrd).unwrap();
        }

        let samples: Vec<MetricSample> = (1..=5).map(|i| watts(&i.to_string(), at(i))).collect();
        engine.store_metric_values(&samples).unwrap();
        engine.generate_report("Stops").unwrap();
        engine.generate_report("Wraps").unwrap();

        assert_eq!(values(&engine, "Stops"), vec!["1", "2", "3"]);
        assert_eq!(values(&engine, "Wraps"), vec!["3", "4", "5"]);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValueInt"), 5);
    }

    #[test]
    fn test_redefinition_marks_streams_dirty() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();

        engine
            .update_report_definition(
                "PowerUsage",
                &serde_json::json!({
                    "Metrics": [{
                        "MetricId": "Watts",
                        "CollectionFunction": "Average",
                        "CollectionDuration": "PT60S"
                    }]
                }),
            )
            .unwrap();
        engine.store_metric_values(&[watts("110", at(10))]).unwrap();

        let probe = watts("0", at(0));
        let instances = load_stream_instances(engine.database().conn(), &probe).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| !i.dirty));
        assert!(instances.iter().any(|i| i.label == "PSU1 Watts - Average (1m)"));

        engine.run_maintenance(MaintenanceCommand::DeleteOrphans).unwrap();
        let instances = load_stream_instances(engine.database().conn(), &probe).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].collection_function, Some(CollectionFunction::Average));
    }

    #[test]
    fn test_samples_nobody_wants_are_dropped() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();

        let summary = engine.store_metric_values(&[volts("12", at(0))]).unwrap();
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.updated_instances, 0);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValue"), 0);
        assert_eq!(engine.scheduler().hwm(), at(0));
    }

    #[test]
    fn test_stream_key_shared_across_fqdds() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Slot1", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60))
            .with_metric(MetricRule::new("Watts").with_fqdd("PSU.Slot.1"));
        engine.add_report_definition(mrd).unwrap();

        let slot1 = engine
            .store_metric_values(&[watts("100", at(0)).with_fqdd("PSU.Slot.1")])
            .unwrap();
        assert_eq!(slot1.updated_instances, 1);

        let slot2 = engine
            .store_metric_values(&[watts("200", at(1)).with_fqdd("PSU.Slot.2")])
            .unwrap();
        assert_eq!(slot2.updated_instances, 0);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValue"), 1);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricInstance"), 1);
    }

    #[test]
    fn test_repeated_values_are_stored_once() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Quiet", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60))
            .with_suppress_dups(true)
            .with_metric(MetricRule::new("Watts"));
        engine.add_report_definition(mrd).unwrap();

        engine
            .store_metric_values(&[watts("100", at(0)), watts("100", at(1))])
            .unwrap();
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValue"), 1);

        let report_name = match engine.generate_report("Quiet").unwrap() {
            GenerationOutcome::Generated { report_name, .. } => report_name,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(values(&engine, &report_name), vec!["100".to_string()]);
    }

    #[test]
    fn test_failed_batch_leaves_clock_alone() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();

        // An open transaction makes the batch's BEGIN IMMEDIATE fail
        engine.database().conn().execute_batch("BEGIN").unwrap();
        let err = engine.store_metric_values(&[watts("110", at(30))]).unwrap_err();
        assert_eq!(err.category(), "storage");
        assert_eq!(engine.scheduler().hwm(), at(0));

        engine.database().conn().execute_batch("ROLLBACK").unwrap();
        engine.store_metric_values(&[watts("110", at(30))]).unwrap();
        assert_eq!(engine.scheduler().hwm(), at(30));
    }

    #[test]
    fn test_unreadable_scratch_restarts_window() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let mrd = MetricReportDefinition::new("Energy", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(secs(60))
            .with_metric(MetricRule::new("Watts").aggregated(CollectionFunction::Summation, secs(60)));
        engine.add_report_definition(mrd).unwrap();
        engine
            .store_metric_values(&[watts("10", at(0)), watts("20", at(10))])
            .unwrap();

        engine
            .database()
            .conn()
            .execute_batch("UPDATE MetricInstance SET CollectionScratch = '{not json'")
            .unwrap();

        let summary = engine.store_metric_values(&[watts("5", at(20))]).unwrap();
        assert_eq!(summary.rejected, 0);
        engine.store_metric_values(&[watts("7", at(60))]).unwrap();

        let flushed: String = engine
            .database()
            .conn()
            .query_row("SELECT Value FROM MetricValue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(flushed, "5");

        let instances = load_stream_instances(engine.database().conn(), &watts("0", at(0))).unwrap();
        assert_eq!(instances[0].scratch.numvalues, 1);
        assert_eq!(instances[0].scratch.sum, 7.0);
    }

    #[test]
    fn test_value_lanes() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine
            .store_metric_values(&[watts("100", at(0)), watts("99.5", at(1)), watts("Absent", at(2))])
            .unwrap();

        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValueInt"), 1);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValueReal"), 1);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValueText"), 1);
    }

    #[test]
    fn test_delete_orphans_keeps_live_streams() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine
            .add_report_definition(
                MetricReportDefinition::new("VoltageUsage", ReportType::Periodic, ReportUpdates::Overwrite)
                    .with_period(secs(60))
                    .with_metric(MetricRule::new("Volts")),
            )
            .unwrap();
        engine
            .store_metric_values(&[watts("100", at(0)), volts("12", at(0))])
            .unwrap();

        engine.delete_report_definition("PowerUsage").unwrap();
        let summary = engine.run_maintenance(MaintenanceCommand::DeleteOrphans).unwrap();

        assert_eq!(summary.ops_run, 4);
        assert_eq!(summary.ops_failed, 0);
        assert_eq!(summary.rows_removed, 4);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricMeta"), 1);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricInstance WHERE Name = 'Watts'"), 0);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValue"), 1);
    }

    #[test]
    fn test_clean_values_caps_each_lane() {
        let mut config = TelemetryConfig::default();
        config.maintenance.value_cap_per_lane = 5;
        let mut engine = TelemetryEngine::new(Database::open_in_memory().unwrap(), &config).unwrap();
        engine.add_report_definition(power_usage()).unwrap();

        let samples: Vec<MetricSample> = (0..8).map(|i| watts(&i.to_string(), at(i))).collect();
        engine.store_metric_values(&samples).unwrap();

        let summary = engine.run_maintenance(MaintenanceCommand::CleanValues).unwrap();
        assert_eq!(summary.rows_removed, 3);
        assert_eq!(count(&engine, "SELECT COUNT(*) FROM MetricValueInt"), 5);
        assert_eq!(count(&engine, "SELECT MIN(Timestamp) FROM MetricValueInt"), at(3).as_nanos());
    }

    #[test]
    fn test_tick_runs_one_maintenance_command() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.request_maintenance(MaintenanceCommand::Vacuum);
        engine.request_maintenance(MaintenanceCommand::CleanValues);

        let now = Timestamp::now();
        assert_eq!(engine.tick(now).unwrap().maintenance, Some(MaintenanceCommand::CleanValues));
        assert_eq!(engine.tick(now).unwrap().maintenance, Some(MaintenanceCommand::Vacuum));
        assert_eq!(engine.tick(now).unwrap().maintenance, None);
    }

    #[test]
    fn test_vacuum_runs_outside_transaction() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let summary = engine.run_maintenance(MaintenanceCommand::Vacuum).unwrap();
        assert_eq!(summary.ops_run, 2);
        assert_eq!(summary.ops_failed, 0);
    }

    #[test]
    fn test_drift_correction_resets_clock() {
        let mut config = TelemetryConfig::default();
        config.reports.correct_drift = true;
        let mut engine = TelemetryEngine::new(Database::open_in_memory().unwrap(), &config).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();

        assert_eq!(engine.tick(at(100)).unwrap().hwm, at(100));
        assert_eq!(engine.scheduler().hwm(), at(100));
    }

    #[test]
    fn test_generic_get_documents() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();
        tick(&mut engine);

        let report = document(&engine, "/redfish/v1/TelemetryService/MetricReports/PowerUsage");
        assert_eq!(report["Id"], "PowerUsage");
        assert_eq!(report["ReportSequence"], 0);
        assert_eq!(report["MetricValues"][0]["MetricId"], "Watts");
        assert_eq!(report["MetricValues"][0]["MetricValue"], "100");
        assert_eq!(report["MetricValues"][0]["Oem"]["Dell"]["Context"], "PSU1");
        assert_eq!(report["MetricValues@odata.count"], 1);

        let mrd = document(&engine, "/redfish/v1/TelemetryService/MetricReportDefinitions/PowerUsage/");
        assert_eq!(mrd["MetricReportDefinitionType"], "Periodic");
        assert_eq!(mrd["Schedule"]["RecurrenceInterval"], "PT60S");
        assert_eq!(mrd["MetricReportDefinitionEnabled"], true);

        let collection = document(&engine, MRD_COLLECTION_URI);
        assert_eq!(collection["Members@odata.count"], 1);

        assert!(engine.generic_get("/redfish/v1/TelemetryService/MetricReports/Nope").unwrap().is_none());
    }

    #[test]
    fn test_metric_definitions_and_triggers() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let md = MetricDefinition {
            metric_id: "Watts".into(),
            name: "Power Consumption".into(),
            description: String::new(),
            metric_type: "Numeric".into(),
            metric_data_type: "Decimal".into(),
            units: "W".into(),
            accuracy: 0.0,
            sensing_interval: "PT10S".into(),
            discrete_values: Vec::new(),
            oem: RuleOem {
                dell: RuleOemDell {
                    fqdd: "PSU.Slot.*".into(),
                    source: String::new(),
                },
            },
        };
        let uri = engine.add_metric_definition(&md).unwrap();
        assert_eq!(uri, format!("{}/Watts", MD_COLLECTION_URI));
        assert!(matches!(
            engine.add_metric_definition(&md).unwrap_err(),
            TelemetryError::AlreadyExists { .. }
        ));
        assert_eq!(find_metric_definition(engine.database().conn(), "Watts").unwrap(), Some(md));
        let body = document(&engine, &uri);
        assert_eq!(body["Units"], "W");
        assert_eq!(body["Oem"]["Dell"]["FQDD"], "PSU.Slot.*");

        let trigger: TriggerDefinition = serde_json::from_value(serde_json::json!({
            "Id": "PowerCap",
            "MetricType": "Numeric",
            "TriggerActions": ["RedfishEvent"],
            "NumericThresholds": { "UpperCritical": { "Reading": 900 } }
        }))
        .unwrap();
        let uri = engine.create_trigger(&trigger).unwrap();
        let body = document(&engine, &uri);
        assert_eq!(body["@odata.id"], uri.as_str());
        assert_eq!(body["NumericThresholds"]["UpperCritical"]["Reading"], 900);
    }

    #[test]
    fn test_delete_metric_report() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        engine.add_report_definition(power_usage()).unwrap();
        engine.store_metric_values(&[watts("100", at(0))]).unwrap();
        tick(&mut engine);

        engine.delete_metric_report("PowerUsage").unwrap();
        assert!(matches!(
            engine.delete_metric_report("PowerUsage").unwrap_err(),
            TelemetryError::NotFound { kind: ResourceKind::Report, .. }
        ));
    }

    #[test]
    fn test_restart_restores_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.db");
        {
            let mut engine = TelemetryEngine::new(Database::open(&path).unwrap(), &TelemetryConfig::default()).unwrap();
            engine.add_report_definition(power_usage()).unwrap();
            engine.store_metric_values(&[watts("100", at(0))]).unwrap();
        }

        let mut engine = TelemetryEngine::new(Database::open(&path).unwrap(), &TelemetryConfig::default()).unwrap();
        assert_eq!(engine.scheduler().hwm(), at(0));
        assert_eq!(engine.scheduler().next_report_time("PowerUsage"), Some(Timestamp::EPOCH));
        assert!(engine.scheduler().is_pending_insert("PowerUsage"));

        assert_eq!(tick(&mut engine).generated, 1);
        assert_eq!(values(&engine, "PowerUsage"), vec!["100"]);
    }
}

// ============================================================================
// SECTION 22: EVENT LOOP TESTS
// ============================================================================

#[cfg(test)]
mod event_loop_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn power_usage() -> MetricReportDefinition {
        MetricReportDefinition::new("PowerUsage", ReportType::Periodic, ReportUpdates::Overwrite)
            .with_period(Duration::from_secs(60))
            .with_metric(MetricRule::new("Watts"))
    }

    fn envelope(command: Command) -> (CommandEnvelope, oneshot::Receiver<CommandResponse>) {
        let (tx, rx) = oneshot::channel();
        let envelope = CommandEnvelope {
            request_id: RequestId::new(),
            command,
            reply: Some(tx),
        };
        (envelope, rx)
    }

    #[test]
    fn test_command_response_pairing() {
        let commands = [
            Command::AddMetricReportDefinition(power_usage()),
            Command::GenerateReport { name: "PowerUsage".into() },
            Command::GenericGet { uri: MRD_COLLECTION_URI.into() },
        ];
        let kinds: Vec<ResponseKind> = commands.iter().map(Command::response_kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResponseKind::AddMetricReportDefinitionResponse,
                ResponseKind::GenerateReportResponse,
                ResponseKind::GenericGetResponse,
            ]
        );
    }

    #[test]
    fn test_failed_command_is_answered_not_fatal() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let (env, mut rx) = envelope(Command::DeleteMetricReport { name: "Nope".into() });
        let request_id = env.request_id;

        engine.handle_event(Event::Command(env)).unwrap();

        let response = rx.try_recv().unwrap();
        assert_eq!(response.request_id, request_id);
        assert_eq!(response.kind, ResponseKind::DeleteMetricReportResponse);
        assert!(matches!(response.result, Err(TelemetryError::NotFound { .. })));
    }

    #[test]
    fn test_missing_document_is_404() {
        let mut engine = TelemetryEngine::in_memory().unwrap();
        let output = engine
            .execute(Command::GenericGet {
                uri: "/redfish/v1/TelemetryService/Triggers/Nope".into(),
            })
            .unwrap();
        match output {
            CommandOutput::Document { status, body } => {
                assert_eq!(status, 404);
                let body: JsonValue = serde_json::from_slice(&body).unwrap();
                assert!(body["error"].as_str().unwrap().contains("Nope"));
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_loop_round_trip() {
        let (handle, task) = spawn_engine(TelemetryEngine::in_memory().unwrap(), 16);
        let mut notifications = handle.subscribe();

        let created = handle
            .execute(Command::AddMetricReportDefinition(power_usage()))
            .await
            .unwrap();
        assert_eq!(
            created,
            CommandOutput::Created {
                uri: format!("{}/PowerUsage", MRD_COLLECTION_URI),
            }
        );

        handle
            .store_metric_values(vec![MetricSample::new("Watts", "100", Timestamp::from_secs(1_700_000_000))
                .with_context("PSU1")])
            .await
            .unwrap();
        handle.publish_clock().await.unwrap();

        let generated = notifications.recv().await.unwrap();
        assert_eq!(generated.report_name, "PowerUsage");

        let ticket = handle
            .submit(Command::GenericGet {
                uri: format!("{}/PowerUsage", MR_COLLECTION_URI),
            })
            .await
            .unwrap();
        assert_eq!(ticket.kind, ResponseKind::GenericGetResponse);
        match ticket.wait().await.unwrap() {
            CommandOutput::Document { status, body } => {
                assert_eq!(status, 200);
                let body: JsonValue = serde_json::from_slice(&body).unwrap();
                assert_eq!(body["MetricValues"][0]["MetricValue"], "100");
            }
            other => panic!("unexpected output {:?}", other),
        }

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_handle_after_shutdown() {
        tokio_test::block_on(async {
            let (handle, task) = spawn_engine(TelemetryEngine::in_memory().unwrap(), 4);
            handle.shutdown();
            task.await.unwrap().unwrap();

            let err = handle
                .execute(Command::GenericGet {
                    uri: MRD_COLLECTION_URI.into(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, TelemetryError::ShuttingDown));
        });
    }
}
