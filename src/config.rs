use crate::{
    models::surface::UploadSurface,
    services::policy::{PolicyTable, UploadPolicy},
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{collections::HashMap, env, fmt, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Where upload sessions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SessionStoreKind {
    /// In-process map; sessions are lost on restart and invisible to other instances.
    Memory,
    /// Tables in the service database; shared by every instance using it.
    Sqlite,
}

impl FromStr for SessionStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(SessionStoreKind::Memory),
            "sqlite" => Ok(SessionStoreKind::Sqlite),
            other => bail!("unknown session store `{}` (expected memory or sqlite)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base of every URL handed to clients (object URLs, pre-signed part URLs).
    pub public_base_url: String,
    pub session_store: SessionStoreKind,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub presign_expiry: Duration,
    pub max_buffered_bytes: u64,
    /// HMAC key for pre-signed part URLs. `None` means generate one per process.
    pub signing_secret: Option<String>,
    /// JSON file of per-surface policy overrides.
    pub policy_file: Option<String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_base_url", &self.public_base_url)
            .field("session_store", &self.session_store)
            .field("session_ttl", &self.session_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("presign_expiry", &self.presign_expiry)
            .field("max_buffered_bytes", &self.max_buffered_bytes)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .field("policy_file", &self.policy_file)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multipart upload coordinator")]
pub struct Args {
    /// Host to bind to (overrides UPLOADS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOADS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects and parts are stored (overrides UPLOADS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOADS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL clients reach this service at (overrides UPLOADS_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Session store backend (overrides UPLOADS_SESSION_STORE)
    #[arg(long, value_enum)]
    pub session_store: Option<SessionStoreKind>,

    /// Seconds an upload session stays open; required (overrides UPLOADS_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between expiry sweeps (overrides UPLOADS_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Lifetime of pre-signed part URLs in seconds (overrides UPLOADS_PRESIGN_EXPIRY_SECS)
    #[arg(long)]
    pub presign_expiry_secs: Option<u64>,

    /// Ceiling on buffered part bytes across sessions (overrides UPLOADS_MAX_BUFFERED_BYTES)
    #[arg(long)]
    pub max_buffered_bytes: Option<u64>,

    /// Secret for signing part URLs (overrides UPLOADS_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// JSON policy overrides keyed by surface (overrides UPLOADS_POLICY_FILE)
    #[arg(long)]
    pub policy_file: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge CLI arguments over values looked up by `env`. CLI wins.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let parsed = |name: &str| -> Result<Option<u64>> {
            env(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("parsing {} value `{}`", name, value))
                })
                .transpose()
        };

        // --- Environment fallback ---
        let host = args
            .host
            .or_else(|| env("UPLOADS_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => match env("UPLOADS_PORT") {
                Some(value) => value
                    .parse::<u16>()
                    .with_context(|| format!("parsing UPLOADS_PORT value `{}`", value))?,
                None => 3000,
            },
        };
        let storage_dir = args
            .storage_dir
            .or_else(|| env("UPLOADS_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/objects".into());
        let database_url = args
            .database_url
            .or_else(|| env("UPLOADS_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let public_base_url = args
            .public_base_url
            .or_else(|| env("UPLOADS_PUBLIC_BASE_URL"))
            .unwrap_or_else(|| {
                let public_host = match host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    other => other,
                };
                format!("http://{}:{}", public_host, port)
            });
        let session_store = match args.session_store {
            Some(kind) => kind,
            None => env("UPLOADS_SESSION_STORE")
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or(SessionStoreKind::Memory),
        };

        let session_ttl_secs = match args.session_ttl_secs {
            Some(secs) => secs,
            None => parsed("UPLOADS_SESSION_TTL_SECS")?.context(
                "session TTL is required: set UPLOADS_SESSION_TTL_SECS or --session-ttl-secs",
            )?,
        };
        if session_ttl_secs == 0 {
            bail!("session TTL must be at least one second");
        }
        let sweep_interval_secs = match args.sweep_interval_secs {
            Some(secs) => secs,
            None => parsed("UPLOADS_SWEEP_INTERVAL_SECS")?.unwrap_or(60),
        }
        .max(1);
        let presign_expiry_secs = match args.presign_expiry_secs {
            Some(secs) => secs,
            None => parsed("UPLOADS_PRESIGN_EXPIRY_SECS")?.unwrap_or(900),
        };
        let max_buffered_bytes = match args.max_buffered_bytes {
            Some(bytes) => bytes,
            None => parsed("UPLOADS_MAX_BUFFERED_BYTES")?.unwrap_or(512 * MIB),
        };

        // --- Merge ---
        let cfg = Self {
            host,
            port,
            storage_dir,
            database_url,
            public_base_url,
            session_store,
            session_ttl: Duration::from_secs(session_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            presign_expiry: Duration::from_secs(presign_expiry_secs),
            max_buffered_bytes,
            signing_secret: args
                .signing_secret
                .or_else(|| env("UPLOADS_SIGNING_SECRET"))
                .filter(|s| !s.is_empty()),
            policy_file: args.policy_file.or_else(|| env("UPLOADS_POLICY_FILE")),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Built-in policy table with any overrides from `policy_file` applied.
    pub fn load_policies(&self) -> Result<PolicyTable> {
        let Some(path) = &self.policy_file else {
            return Ok(PolicyTable::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path))?;
        let overrides: HashMap<UploadSurface, UploadPolicy> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing policy file {}", path))?;
        for (surface, policy) in &overrides {
            if policy.min_part_size == 0 {
                bail!("policy for {} has a zero minimum part size", surface);
            }
        }
        Ok(PolicyTable::with_overrides(overrides))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn session_ttl_is_required() {
        let err = AppConfig::resolve(Args::default(), env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("session TTL is required"));
    }

    #[test]
    fn env_supplies_values_and_cli_wins() {
        let args = Args {
            port: Some(8080),
            ..Default::default()
        };
        let (cfg, migrate) = AppConfig::resolve(
            args,
            env_of(&[
                ("UPLOADS_PORT", "9000"),
                ("UPLOADS_SESSION_TTL_SECS", "600"),
                ("UPLOADS_SESSION_STORE", "sqlite"),
            ]),
        )
        .unwrap();
        assert!(!migrate);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.session_ttl, Duration::from_secs(600));
        assert_eq!(cfg.session_store, SessionStoreKind::Sqlite);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.presign_expiry, Duration::from_secs(900));
        assert_eq!(cfg.max_buffered_bytes, 512 * MIB);
        assert_eq!(cfg.public_base_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = AppConfig::resolve(
            Args::default(),
            env_of(&[("UPLOADS_SESSION_TTL_SECS", "ten minutes")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("UPLOADS_SESSION_TTL_SECS"));
    }

    #[test]
    fn policy_file_overrides_named_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"{"campaign_photo": {
                "allowedMimeTypes": ["image/jpeg"],
                "maxFileSize": 1048576,
                "minPartSize": 262144,
                "maxPartSize": 1048576,
                "keyPrefix": "supporters",
                "defaultStrategy": "buffered"
            }}"#,
        )
        .unwrap();
        let args = Args {
            session_ttl_secs: Some(60),
            policy_file: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let (cfg, _) = AppConfig::resolve(args, env_of(&[])).unwrap();
        let table = cfg.load_policies().unwrap();
        assert_eq!(table.policy(UploadSurface::CampaignPhoto).key_prefix, "supporters");
        assert_eq!(table.policy(UploadSurface::Media).key_prefix, "media");
    }
}
