use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging & tracing export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Line format of the `serve` log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human-readable lines for a terminal.
    Pretty,
}

/// `[observability]`: log format plus optional OTLP span export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint (e.g. `http://localhost:4317`).  Export is off
    /// when unset or blank.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// The `service.name` resource attribute reported to the collector.
    #[serde(default = "d_service_name")]
    pub service_name: String,

    /// Trace sampling ratio in `[0, 1]`.
    #[serde(default = "d_sample_rate")]
    pub sample_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            otlp_endpoint: None,
            service_name: d_service_name(),
            sample_rate: d_sample_rate(),
        }
    }
}

impl ObservabilityConfig {
    /// The configured collector endpoint, ignoring blank values.
    pub fn otlp_endpoint(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_service_name() -> String {
    "presence-keeper".into()
}

fn d_sample_rate() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_logs_json_without_export() {
        let cfg: ObservabilityConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.otlp_endpoint().is_none());
        assert_eq!(cfg.service_name, "presence-keeper");
    }

    #[test]
    fn pretty_format_and_endpoint_parse() {
        let cfg: ObservabilityConfig = toml::from_str(
            r#"
            log_format = "pretty"
            otlp_endpoint = "http://otel:4317"
            sample_rate = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.otlp_endpoint(), Some("http://otel:4317"));
        assert!((cfg.sample_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn blank_endpoint_disables_export() {
        let cfg = ObservabilityConfig {
            otlp_endpoint: Some("   ".into()),
            ..Default::default()
        };
        assert!(cfg.otlp_endpoint().is_none());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(toml::from_str::<ObservabilityConfig>(r#"log_format = "xml""#).is_err());
    }
}
