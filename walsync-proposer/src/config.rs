//! Proposer configuration.

use std::fmt;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use walsync_core::{MAX_SAFEKEEPERS, TenantId, TimelineId};

/// Configuration of one proposer instance, as handed over by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hex-encoded 16-byte tenant identifier.
    pub tenant_id: String,
    /// Hex-encoded 16-byte timeline identifier.
    pub timeline_id: String,
    /// Comma-separated safekeeper endpoints: `host1:port1,host2:port2`.
    pub safekeepers: String,
    /// Offline safekeepers are reconnected once per this interval, in
    /// milliseconds. Zero or negative disables reconnection.
    pub reconnect_timeout_ms: i64,
    /// A connection that stays silent this long, in milliseconds, is torn
    /// down.
    pub connection_timeout_ms: i64,
    /// WAL segment size in bytes; advertised in the greeting and used to
    /// recognize segment-start page headers.
    pub wal_seg_size: u32,
    /// Run until a quorum confirms the epoch start position, then exit,
    /// instead of streaming indefinitely.
    pub sync_safekeepers: bool,
    /// Host system identifier, echoed in the greeting.
    pub system_id: u64,
    /// Host timeline ordinal, echoed in the greeting.
    pub pg_timeline: u32,
    /// Host version number, echoed in the greeting.
    pub pg_version: u32,
}

/// Marker for configuration failures; details travel as
/// `error_stack` attachments.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid proposer configuration")
    }
}

impl std::error::Error for ConfigError {}

/// One configured safekeeper endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
    /// Full connection string. May embed credentials; never log it.
    pub conninfo: String,
}

impl Endpoint {
    /// `host:port`, safe for logs.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) struct ResolvedConfig {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub endpoints: Vec<Endpoint>,
}

impl Config {
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig, Report<ConfigError>> {
        let tenant_id = self
            .tenant_id
            .parse::<TenantId>()
            .change_context(ConfigError)
            .attach_printable_lazy(|| format!("tenant_id: {:?}", self.tenant_id))?;
        let timeline_id = self
            .timeline_id
            .parse::<TimelineId>()
            .change_context(ConfigError)
            .attach_printable_lazy(|| format!("timeline_id: {:?}", self.timeline_id))?;

        let mut endpoints = Vec::new();
        for entry in self.safekeepers.split(',').filter(|s| !s.is_empty()) {
            let Some((host, port)) = entry.rsplit_once(':') else {
                return Err(Report::new(ConfigError)
                    .attach_printable(format!("safekeeper {entry:?} has no port")));
            };
            if host.is_empty() || port.is_empty() {
                return Err(Report::new(ConfigError)
                    .attach_printable(format!("safekeeper {entry:?} has an empty host or port")));
            }
            let conninfo = format!(
                "host={host} port={port} dbname=replication \
                 options='-c timeline_id={} tenant_id={}'",
                self.timeline_id, self.tenant_id,
            );
            endpoints.push(Endpoint {
                host: host.to_owned(),
                port: port.to_owned(),
                conninfo,
            });
        }

        if endpoints.is_empty() {
            return Err(Report::new(ConfigError).attach_printable("no safekeepers configured"));
        }
        if endpoints.len() > MAX_SAFEKEEPERS {
            return Err(Report::new(ConfigError).attach_printable(format!(
                "{} safekeepers configured, at most {MAX_SAFEKEEPERS} supported",
                endpoints.len()
            )));
        }

        Ok(ResolvedConfig {
            tenant_id,
            timeline_id,
            endpoints,
        })
    }
}
