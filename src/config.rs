use crate::services::{
    backend::S3_MIN_PART_SIZE,
    dispatcher::DispatcherSettings,
    naming::DEFAULT_MAX_NAME_ATTEMPTS,
    uploader::UploaderSettings,
};
use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Offset, Utc};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Which object backend records are persisted to.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Keep objects in process memory (lost on exit).
    Memory,
    /// SQLite metadata plus files under the storage directory.
    Local,
    /// Amazon S3 or an S3-compatible endpoint.
    S3,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: Option<String>,
    pub region: String,
    pub min_chunk_size: usize,
    pub emulated_min_part_size: usize,
    pub partition_queue_capacity: usize,
    pub dispatch_queue_capacity: usize,
    pub partition_offset: FixedOffset,
    pub max_name_attempts: u32,
    pub final_flush_timeout: Option<Duration>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chat log ingestion into multipart object storage")]
pub struct Args {
    /// Host to bind to (overrides CHATLOG_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHATLOG_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Object backend (overrides CHATLOG_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Payload directory of the local backend (overrides CHATLOG_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database of the local backend (overrides CHATLOG_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// S3 bucket (overrides BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,

    /// S3 region (overrides AWS_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Buffered bytes that trigger a part upload (overrides CHATLOG_MIN_CHUNK_SIZE)
    #[arg(long)]
    pub min_chunk_size: Option<usize>,

    /// Minimum non-final part size enforced by the memory and local backends
    /// (overrides CHATLOG_EMULATED_MIN_PART_SIZE)
    #[arg(long)]
    pub emulated_min_part_size: Option<usize>,

    /// Queue capacity of each partition uploader (overrides CHATLOG_PARTITION_QUEUE_CAPACITY)
    #[arg(long)]
    pub partition_queue_capacity: Option<usize>,

    /// Queue capacity in front of the dispatcher (overrides CHATLOG_DISPATCH_QUEUE_CAPACITY)
    #[arg(long)]
    pub dispatch_queue_capacity: Option<usize>,

    /// UTC offset at which partition days are cut, e.g. +02:00
    /// (overrides CHATLOG_PARTITION_UTC_OFFSET)
    #[arg(long, value_parser = parse_utc_offset, allow_hyphen_values = true)]
    pub partition_utc_offset: Option<FixedOffset>,

    /// Storage names tried per partition before giving up (overrides CHATLOG_MAX_NAME_ATTEMPTS)
    #[arg(long)]
    pub max_name_attempts: Option<u32>,

    /// Bound on each partition's shutdown flush, in seconds
    /// (overrides CHATLOG_FINAL_FLUSH_TIMEOUT_SECS)
    #[arg(long)]
    pub final_flush_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge parsed CLI args over values looked up with `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match args.backend {
            Some(kind) => kind,
            None => match lookup("CHATLOG_BACKEND") {
                Some(value) => BackendKind::from_str(&value, true)
                    .map_err(|err| anyhow!("parsing CHATLOG_BACKEND value `{}`: {}", value, err))?,
                None => BackendKind::Memory,
            },
        };

        let partition_offset = match args.partition_utc_offset {
            Some(offset) => offset,
            None => match lookup("CHATLOG_PARTITION_UTC_OFFSET") {
                Some(value) => parse_utc_offset(&value).map_err(|err| {
                    anyhow!("parsing CHATLOG_PARTITION_UTC_OFFSET value `{}`: {}", value, err)
                })?,
                None => utc(),
            },
        };

        let final_flush_timeout = match args.final_flush_timeout_secs {
            Some(secs) => Some(secs),
            None => env_parse_opt(&lookup, "CHATLOG_FINAL_FLUSH_TIMEOUT_SECS")?,
        }
        .map(Duration::from_secs);

        let cfg = Self {
            host: args
                .host
                .or_else(|| lookup("CHATLOG_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: merged(args.port, &lookup, "CHATLOG_PORT", 8080)?,
            backend,
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("CHATLOG_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("CHATLOG_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/chatlog.db".into()),
            bucket: args.bucket.or_else(|| lookup("BUCKET_NAME")),
            region: args
                .region
                .or_else(|| lookup("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".into()),
            min_chunk_size: merged(
                args.min_chunk_size,
                &lookup,
                "CHATLOG_MIN_CHUNK_SIZE",
                S3_MIN_PART_SIZE,
            )?,
            emulated_min_part_size: merged(
                args.emulated_min_part_size,
                &lookup,
                "CHATLOG_EMULATED_MIN_PART_SIZE",
                S3_MIN_PART_SIZE,
            )?,
            partition_queue_capacity: merged(
                args.partition_queue_capacity,
                &lookup,
                "CHATLOG_PARTITION_QUEUE_CAPACITY",
                10,
            )?,
            dispatch_queue_capacity: merged(
                args.dispatch_queue_capacity,
                &lookup,
                "CHATLOG_DISPATCH_QUEUE_CAPACITY",
                10,
            )?,
            partition_offset,
            max_name_attempts: merged(
                args.max_name_attempts,
                &lookup,
                "CHATLOG_MAX_NAME_ATTEMPTS",
                DEFAULT_MAX_NAME_ATTEMPTS,
            )?,
            final_flush_timeout,
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            queue_capacity: self.dispatch_queue_capacity,
            partition_offset: self.partition_offset,
            max_name_attempts: self.max_name_attempts,
            uploader: UploaderSettings {
                min_chunk_size: self.min_chunk_size,
                queue_capacity: self.partition_queue_capacity,
                final_flush_timeout: self.final_flush_timeout,
            },
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// CLI value if given, else the parsed environment value, else `default`.
fn merged<T>(
    cli: Option<T>,
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match cli {
        Some(value) => Ok(value),
        None => Ok(env_parse_opt(lookup, key)?.unwrap_or(default)),
    }
}

fn env_parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|err| anyhow!("{}", err))
                .with_context(|| format!("parsing {} value `{}`", key, value))
        })
        .transpose()
}

/// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH` into an offset.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return Ok(utc());
    }

    let (sign, rest) = match value.as_bytes().first() {
        Some(b'+') => (1, &value[1..]),
        Some(b'-') => (-1, &value[1..]),
        _ => return Err(format!("offset `{value}` must start with + or -")),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) || !matches!(digits.len(), 2 | 4) {
        return Err(format!("offset `{value}` is not in +HH:MM form"));
    }

    let hours: i32 = digits[..2].parse().map_err(|_| format!("bad hours in `{value}`"))?;
    let minutes: i32 = if digits.len() == 4 {
        digits[2..].parse().map_err(|_| format!("bad minutes in `{value}`"))?
    } else {
        0
    };
    if minutes >= 60 {
        return Err(format!("offset `{value}` has more than 59 minutes"));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset `{value}` is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(cli: &[&str], env: &[(&str, &str)]) -> Result<AppConfig> {
        let args = Args::try_parse_from(std::iter::once("chatlog-sink").chain(cli.iter().copied()))?;
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(args, |key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_cli_or_env() {
        let cfg = resolve(&[], &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.backend, BackendKind::Memory);
        assert_eq!(cfg.min_chunk_size, 5 * 1024 * 1024);
        assert_eq!(cfg.partition_queue_capacity, 10);
        assert_eq!(cfg.dispatch_queue_capacity, 10);
        assert_eq!(cfg.partition_offset.local_minus_utc(), 0);
        assert_eq!(cfg.max_name_attempts, 1000);
        assert!(cfg.final_flush_timeout.is_none());
    }

    #[test]
    fn cli_overrides_env() {
        let cfg = resolve(
            &["--port", "9000", "--backend", "local", "--min-chunk-size", "6291456"],
            &[
                ("CHATLOG_PORT", "7000"),
                ("CHATLOG_BACKEND", "s3"),
                ("CHATLOG_MIN_CHUNK_SIZE", "1"),
                ("BUCKET_NAME", "chat-logs"),
                ("CHATLOG_FINAL_FLUSH_TIMEOUT_SECS", "30"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.backend, BackendKind::Local);
        assert_eq!(cfg.min_chunk_size, 6_291_456);
        assert_eq!(cfg.bucket.as_deref(), Some("chat-logs"));
        assert_eq!(cfg.final_flush_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn invalid_env_values_name_the_variable() {
        let err = resolve(&[], &[("CHATLOG_PORT", "eighty")]).unwrap_err();
        assert!(format!("{err:#}").contains("CHATLOG_PORT"));

        let err = resolve(&[], &[("CHATLOG_BACKEND", "ftp")]).unwrap_err();
        assert!(err.to_string().contains("CHATLOG_BACKEND"));
    }

    #[test]
    fn partition_offset_parses_from_env_and_cli() {
        let cfg = resolve(&[], &[("CHATLOG_PARTITION_UTC_OFFSET", "+02:00")]).unwrap();
        assert_eq!(cfg.partition_offset.local_minus_utc(), 7200);

        let cfg = resolve(&["--partition-utc-offset", "-0530"], &[]).unwrap();
        assert_eq!(cfg.partition_offset.local_minus_utc(), -(5 * 3600 + 30 * 60));
    }

    #[test]
    fn offsets_west_of_utc_parse_in_both_cli_forms() {
        let cfg = resolve(&["--partition-utc-offset", "-05:30", "--port", "9000"], &[]).unwrap();
        assert_eq!(cfg.partition_offset.local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(cfg.port, 9000);

        let cfg = resolve(&["--partition-utc-offset=-08:00"], &[]).unwrap();
        assert_eq!(cfg.partition_offset.local_minus_utc(), -8 * 3600);
    }

    #[test]
    fn utc_offset_parser_rejects_garbage() {
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("+09").unwrap().local_minus_utc(), 9 * 3600);
        assert!(parse_utc_offset("02:00").is_err());
        assert!(parse_utc_offset("+2:00").is_err());
        assert!(parse_utc_offset("+02:75").is_err());
        assert!(parse_utc_offset("+30:00").is_err());
    }

    #[test]
    fn dispatcher_settings_carry_queue_and_chunk_config() {
        let cfg = resolve(
            &["--partition-queue-capacity", "3", "--dispatch-queue-capacity", "4"],
            &[],
        )
        .unwrap();
        let settings = cfg.dispatcher_settings();
        assert_eq!(settings.queue_capacity, 4);
        assert_eq!(settings.uploader.queue_capacity, 3);
        assert_eq!(settings.uploader.min_chunk_size, cfg.min_chunk_size);
    }
}
