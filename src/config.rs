//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// Multipart field that must carry the minidump.
pub const MINIDUMP_FIELD: &str = "upload_file_minidump";
/// Form field inspected by the uploader version gate.
pub const UPLOADER_FIELD: &str = "Uploader";
pub const REPORT_ID_PREFIX: &str = "ccr-";
pub const REPORT_ID_WIDTH: usize = 8;
pub const COUNTER_FILE: &str = "id";
/// Service-private state inside the uploads root; report directories sit beside it.
pub const STATE_DIR: &str = ".ccr";
pub const COUNTER_LOCK_FILE: &str = ".ccr/id.lock";
pub const INCOMING_DIR: &str = ".ccr/incoming";
pub const UPDATE_REQUIRED_MESSAGE: &str =
    "Your crash reporter is too old to submit reports. Please update to the latest version.";
pub const DEFAULT_COUNTER_LOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_INCOMING_TTL_SECS: u64 = 60 * 60;
pub const INCOMING_SWEEP_INTERVAL_SECS: u64 = 600;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "ccr-intake", version = VERSION_INFO, about = "Crash report intake server")]
pub struct Args {
    #[arg(
        short = 'u',
        long,
        env = "CCR_UPLOADS_DIR",
        default_value = ".ccr/uploads",
        help = "Root directory for stored crash reports"
    )]
    pub uploads_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "CCR_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CCR_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "CCR_MIN_UPLOADER_BUILD",
        help = "Reject reports whose Uploader build is older than this (disabled when unset)"
    )]
    pub min_uploader_build: Option<u64>,
    #[arg(
        long,
        env = "CCR_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max request body size in bytes"
    )]
    pub max_upload_size: usize,
    #[arg(
        long,
        env = "CCR_TRUST_FORWARDED_FOR",
        default_value_t = false,
        help = "Take the client address from X-Forwarded-For"
    )]
    pub trust_forwarded_for: bool,
    #[arg(
        long,
        env = "CCR_INCOMING_TTL_SECS",
        default_value_t = DEFAULT_INCOMING_TTL_SECS,
        help = "Age in seconds after which abandoned uploads are removed (0 to disable)"
    )]
    pub incoming_ttl_secs: u64,
}
