//! Streaming sink configuration: the Icecast-style mount point this
//! publisher pushes to, plus its credentials and identification headers.
//!
//! Kept separate from `openstudio_common::config::StationManifest` (which
//! is served verbatim to clients at `GET /api/station`): sink credentials
//! must never reach that public endpoint, so this loads its own
//! env-var-layered config, the same `dotenvy`-backed convention the
//! manifest loader uses.

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub mount_point: String,
    pub username: String,
    pub password: String,
    pub stream_name: String,
    pub stream_description: String,
    pub is_public: bool,
    pub bitrate_kbps: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{0}")]
    Invalid(String),
}

impl SinkConfig {
    /// `PUT {host}:{port}{mount_point}` is the exact push target, per the
    /// external sink protocol's contract.
    pub fn push_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.mount_point)
    }

    pub fn from_env() -> Result<Self, SinkConfigError> {
        let _ = dotenvy::dotenv();

        let host = require_env("OPENSTUDIO_SINK_HOST")?;
        let port = require_env("OPENSTUDIO_SINK_PORT")?
            .parse::<u16>()
            .map_err(|e| SinkConfigError::Invalid(format!("OPENSTUDIO_SINK_PORT: {e}")))?;
        let mount_point = require_env("OPENSTUDIO_SINK_MOUNT")?;
        let username = require_env("OPENSTUDIO_SINK_USERNAME")?;
        let password = require_env("OPENSTUDIO_SINK_PASSWORD")?;
        let stream_name = std::env::var("OPENSTUDIO_SINK_STREAM_NAME")
            .unwrap_or_else(|_| "OpenStudio".to_string());
        let stream_description = std::env::var("OPENSTUDIO_SINK_STREAM_DESCRIPTION")
            .unwrap_or_else(|_| "Live from OpenStudio".to_string());
        let is_public = std::env::var("OPENSTUDIO_SINK_PUBLIC")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let bitrate_kbps = std::env::var("OPENSTUDIO_SINK_BITRATE_KBPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(128);

        if !mount_point.starts_with('/') {
            return Err(SinkConfigError::Invalid(
                "OPENSTUDIO_SINK_MOUNT must start with '/'".to_string(),
            ));
        }
        crate::encoder::validate_bitrate(bitrate_kbps)
            .map_err(|e| SinkConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            host,
            port,
            mount_point,
            username,
            password,
            stream_name,
            stream_description,
            is_public,
            bitrate_kbps,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, SinkConfigError> {
    std::env::var(key).map_err(|_| SinkConfigError::Missing(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_url_matches_the_host_port_mount_point_contract() {
        let cfg = SinkConfig {
            host: "icecast.example".to_string(),
            port: 8000,
            mount_point: "/station.opus".to_string(),
            username: "source".to_string(),
            password: "hunter2".to_string(),
            stream_name: "Test".to_string(),
            stream_description: "Test station".to_string(),
            is_public: false,
            bitrate_kbps: 128,
        };
        assert_eq!(cfg.push_url(), "http://icecast.example:8000/station.opus");
    }
}
