//! Command line configuration

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use servicebinding_common::telemetry::LogFormat;
use servicebinding_webhook::controller::{
    DEFAULT_MUTATING_CONFIGURATION, DEFAULT_VALIDATING_CONFIGURATION,
};

/// ServiceBinding operator - projects bound services into workloads
#[derive(Parser, Debug, Clone)]
#[command(name = "servicebinding", version, about, long_about = None)]
pub struct Config {
    /// Print the ServiceBinding CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Name of the MutatingWebhookConfiguration to keep in sync
    #[arg(
        long,
        env = "SERVICEBINDING_MUTATING_WEBHOOK",
        default_value = DEFAULT_MUTATING_CONFIGURATION
    )]
    pub mutating_webhook_name: String,

    /// Name of the ValidatingWebhookConfiguration to keep in sync
    #[arg(
        long,
        env = "SERVICEBINDING_VALIDATING_WEBHOOK",
        default_value = DEFAULT_VALIDATING_CONFIGURATION
    )]
    pub validating_webhook_name: String,

    /// Bind address of the admission server
    #[arg(long, env = "SERVICEBINDING_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub webhook_addr: SocketAddr,

    /// PEM certificate served by the admission server
    #[arg(
        long,
        env = "SERVICEBINDING_TLS_CERT",
        default_value = "/var/run/servicebinding/tls/tls.crt"
    )]
    pub tls_cert: PathBuf,

    /// PEM private key of the admission server
    #[arg(
        long,
        env = "SERVICEBINDING_TLS_KEY",
        default_value = "/var/run/servicebinding/tls/tls.key"
    )]
    pub tls_key: PathBuf,

    /// Log output format: json or text
    #[arg(long, env = "SERVICEBINDING_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Run the controllers without the admission server
    #[arg(long)]
    pub disable_webhook_server: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["servicebinding"]).expect("defaults should parse");

        assert!(!config.crd);
        assert!(!config.disable_webhook_server);
        assert_eq!(config.mutating_webhook_name, "servicebinding-admission-projector");
        assert_eq!(config.validating_webhook_name, "servicebinding-trigger");
        assert_eq!(config.webhook_addr.port(), 9443);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.tls_key,
            PathBuf::from("/var/run/servicebinding/tls/tls.key")
        );
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "servicebinding",
            "--log-format",
            "text",
            "--webhook-addr",
            "127.0.0.1:8443",
            "--mutating-webhook-name",
            "custom-projector",
            "--disable-webhook-server",
        ])
        .expect("flags should parse");

        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.webhook_addr.to_string(), "127.0.0.1:8443");
        assert_eq!(config.mutating_webhook_name, "custom-projector");
        assert!(config.disable_webhook_server);
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Config::try_parse_from(["servicebinding", "--log-format", "yaml"]).is_err());
    }
}
