//! Command-line surface.
//!
//! Every knob is read once at startup and injected into the filesystem
//! construction; nothing here is re-read while the mount is live.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{other}' in '{raw}'")),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "hopsfs-mount",
    version,
    about = "Mount a HopsFS/HDFS namespace as a local filesystem."
)]
pub struct Args {
    /// Name node endpoint.
    #[arg(value_name = "NAMENODE:PORT")]
    pub namenode: String,

    /// Local directory to mount on.
    #[arg(value_name = "MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Mount even when the DFS is not reachable yet.
    #[arg(long = "lazy", default_value_t = false)]
    pub lazy: bool,

    /// Time limit for all retry attempts of one failed operation.
    #[arg(long = "retryTimeLimit", default_value = "5m", value_parser = parse_duration)]
    pub retry_time_limit: Duration,

    /// Maximum retry attempts for failed operations.
    #[arg(long = "retryMaxAttempts", default_value_t = 10)]
    pub retry_max_attempts: u32,

    /// Minimum delay between retries (the first retry is always immediate).
    #[arg(long = "retryMinDelay", default_value = "1s", value_parser = parse_duration)]
    pub retry_min_delay: Duration,

    /// Maximum delay between retries.
    #[arg(long = "retryMaxDelay", default_value = "60s", value_parser = parse_duration)]
    pub retry_max_delay: Duration,

    /// Comma-separated path prefixes exposed through the mount point.
    #[arg(long = "allowedPrefixes", default_value = "*")]
    pub allowed_prefixes: String,

    /// Mount read-only.
    #[arg(long = "readOnly", default_value_t = false)]
    pub read_only: bool,

    /// Log verbosity: error, warn, info, debug or trace.
    #[arg(long = "logLevel", default_value = "info")]
    pub log_level: String,

    /// Directory for the anonymous write-staging files.
    #[arg(long = "stageDir", default_value = "/tmp")]
    pub stage_dir: PathBuf,

    /// Connect to the name node over TLS.
    #[arg(long = "tls", default_value_t = false)]
    pub tls: bool,

    #[arg(
        long = "rootCABundle",
        default_value = "/srv/hops/super_crypto/hdfs/hops_root_ca.pem"
    )]
    pub root_ca_bundle: PathBuf,

    #[arg(
        long = "clientCertificate",
        default_value = "/srv/hops/super_crypto/hdfs/hdfs_certificate_bundle.pem"
    )]
    pub client_certificate: PathBuf,

    #[arg(
        long = "clientKey",
        default_value = "/srv/hops/super_crypto/hdfs/hdfs_priv.pem"
    )]
    pub client_key: PathBuf,

    /// DFS directory projected at the mount root.
    #[arg(long = "srcDir", default_value = "/")]
    pub src_dir: String,

    /// Log file path; logs go to the console when unset.
    #[arg(long = "logFile")]
    pub log_file: Option<PathBuf>,

    /// Number of connections to the name node.
    #[arg(long = "numConnections", default_value_t = 1)]
    pub num_connections: usize,

    /// Attribute every DFS operation to this user name.
    #[arg(long = "hopsFSUserName", default_value = "")]
    pub hopsfs_user_name: String,

    /// Derive the effective group from the /Projects/<P>/<D>/ dataset path.
    #[arg(long = "getGroupFromHopsFSDatasetPath", default_value_t = false)]
    pub group_from_dataset_path: bool,

    /// Allow other users to access the mount.
    #[arg(long = "allowOther", default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_other: bool,

    /// Let the kernel page cache serve reads and buffer writes. Off by
    /// default: the cache goes stale when other DFS clients modify files.
    #[arg(long = "enablePageCache", default_value_t = false)]
    pub enable_page_cache: bool,
}

impl Args {
    pub fn allowed_prefix_list(&self) -> Vec<String> {
        self.allowed_prefixes
            .split(',')
            .map(str::to_owned)
            .collect()
    }

    pub fn force_username(&self) -> Option<String> {
        if self.hopsfs_user_name.is_empty() {
            None
        } else {
            Some(self.hopsfs_user_name.clone())
        }
    }
}
