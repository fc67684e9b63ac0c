//! Command-line argument parsing
//!
//! Every option can also be supplied through the environment, which is how
//! the importer is configured when it runs inside a pod.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "disk-image-importer")]
#[command(about = "Stream a disk image into a single-layer OCI image in a container registry")]
#[command(version)]
pub struct Args {
    /// Source type: http, registry, file or block-device
    #[arg(long = "source", env = "IMPORTER_SOURCE", default_value = "http")]
    pub source: String,

    /// Source URL, path, or image reference (optionally prefixed with docker://)
    #[arg(long = "endpoint", short = 'e', env = "IMPORTER_ENDPOINT")]
    pub endpoint: String,

    /// Username for the HTTP or registry source
    #[arg(long = "source-username", env = "IMPORTER_ACCESS_KEY_ID")]
    pub source_username: Option<String>,

    /// Password for the HTTP or registry source
    #[arg(long = "source-password", env = "IMPORTER_SECRET_KEY", hide_env_values = true)]
    pub source_password: Option<String>,

    /// Skip TLS verification of the HTTP or registry source
    #[arg(long = "source-insecure-tls", env = "INSECURE_TLS")]
    pub source_insecure_tls: bool,

    /// Docker config.json to take source registry credentials from
    #[arg(long = "source-auth-config", env = "IMPORTER_AUTH_CONFIG")]
    pub source_auth_config: Option<PathBuf>,

    /// Destination image reference: <registry>/<repository>[:tag]
    #[arg(long = "destination", short = 'd', env = "IMPORTER_DESTINATION_ENDPOINT")]
    pub destination: String,

    /// Registry username
    #[arg(long = "username", short = 'u', env = "IMPORTER_DESTINATION_ACCESS_KEY_ID")]
    pub username: Option<String>,

    /// Registry password
    #[arg(
        long = "password",
        short = 'p',
        env = "IMPORTER_DESTINATION_SECRET_KEY",
        hide_env_values = true
    )]
    pub password: Option<String>,

    /// Docker config.json to take registry credentials from
    #[arg(long = "auth-config", env = "IMPORTER_DESTINATION_AUTH_CONFIG")]
    pub auth_config: Option<PathBuf>,

    /// Skip TLS verification of the destination registry
    #[arg(long = "insecure-tls", short = 'k', env = "DESTINATION_INSECURE_TLS")]
    pub insecure_tls: bool,

    /// Expected sha256 of the source image
    #[arg(long = "sha256", env = "IMPORTER_SHA256SUM")]
    pub sha256: Option<String>,

    /// Expected md5 of the source image
    #[arg(long = "md5", env = "IMPORTER_MD5SUM")]
    pub md5: Option<String>,

    /// Owner identifier attached to progress metrics
    #[arg(long = "owner-uid", env = "OWNER_UID", default_value = "")]
    pub owner_uid: String,

    /// Disable the prometheus progress gauges and their endpoint
    #[arg(long = "no-metrics")]
    pub no_metrics: bool,

    /// Listen address of the prometheus metrics endpoint
    #[arg(long = "metrics-addr", env = "IMPORTER_METRICS_ADDR", default_value = "0.0.0.0:8443")]
    pub metrics_addr: SocketAddr,

    /// Layer compression: gzip or none
    #[arg(long = "layer-compression", default_value = "gzip")]
    pub layer_compression: String,

    /// Maximum number of import attempts
    #[arg(long = "retry", default_value = "3")]
    pub retry: u32,

    /// Initial delay between attempts in seconds
    #[arg(long = "retry-delay", default_value = "10")]
    pub retry_delay: u64,

    /// Upper bound for the delay between attempts in seconds
    #[arg(long = "retry-max-delay", default_value = "60")]
    pub retry_max_delay: u64,

    /// Retry when the checksum does not match
    #[arg(long = "retry-on-checksum-mismatch")]
    pub retry_on_checksum_mismatch: bool,

    /// Path of the qemu-img binary
    #[arg(long = "qemu-img", default_value = "qemu-img")]
    pub qemu_img: PathBuf,

    /// Path of the file binary
    #[arg(long = "file-cmd", default_value = "file")]
    pub file_cmd: PathBuf,

    /// Bytes of the image prefix given to the format tools
    #[arg(long = "inspect-prefix-size", default_value = "67108864")]
    pub inspect_prefix_size: u64,

    /// Directory for the inspection temp file
    #[arg(long = "temp-dir", env = "TMPDIR")]
    pub temp_dir: Option<PathBuf>,

    /// Where to write the final JSON report
    #[arg(long = "report-path", default_value = "/dev/termination-log")]
    pub report_path: PathBuf,

    /// Log format: pretty or json
    #[arg(long = "log-format", default_value = "pretty")]
    pub log_format: String,

    /// Verbose output
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_flags_with_defaults() {
        let args = Args::try_parse_from([
            "disk-image-importer",
            "--endpoint",
            "https://mirror.example.com/jammy.img",
            "--destination",
            "registry.local/vi/jammy:v1",
        ])
        .unwrap();

        assert_eq!(args.source, "http");
        assert_eq!(args.retry, 3);
        assert_eq!(args.inspect_prefix_size, 64 * 1024 * 1024);
        assert_eq!(args.layer_compression, "gzip");
        assert_eq!(args.report_path, PathBuf::from("/dev/termination-log"));
        assert_eq!(args.metrics_addr, "0.0.0.0:8443".parse::<SocketAddr>().unwrap());
        assert!(!args.insecure_tls);
    }

    #[test]
    fn accepts_short_flags() {
        let args = Args::try_parse_from([
            "disk-image-importer",
            "-e",
            "/dev/xvda",
            "-d",
            "registry.local/vi/disk",
            "-u",
            "admin",
            "-p",
            "secret",
            "-k",
            "--source",
            "block-device",
        ])
        .unwrap();

        assert_eq!(args.source, "block-device");
        assert_eq!(args.username.as_deref(), Some("admin"));
        assert!(args.insecure_tls);
    }

    #[test]
    fn rejects_malformed_metrics_address() {
        let result = Args::try_parse_from([
            "disk-image-importer",
            "-e",
            "/dev/xvda",
            "-d",
            "registry.local/vi/disk",
            "--metrics-addr",
            "localhost",
        ]);
        assert!(result.is_err());
    }
}
