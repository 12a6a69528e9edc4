use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::{
    env,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

const ENV_PREFIX: &str = "PIXSTASH_";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 37374;
const DEFAULT_DATABASE_URL: &str = "sqlite://./data/pixstash.db";
const DEFAULT_PASSWORD: &str = "admin";
const DEFAULT_REMOTE_BASE_URL: &str = "https://i.111666.best";
const DEFAULT_CHUNK_SIZE: usize = 6 * 1024 * 1024;
const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
const DEFAULT_SESSION_SWEEP_SECS: u64 = 3600;
const DEFAULT_BUFFER_POOL_SIZE: usize = 8;

/// Centralized application configuration.
/// Resolved from CLI arguments, an optional YAML file and environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Login password for the web session.
    pub password: String,
    /// Transfer credential handed to the web client via `/api/config`.
    pub auth_token: Option<String>,
    /// Key expected in `X-API-Key` on `/api/v1` routes.
    pub api_key: String,
    /// Prefix for share links, e.g. `https://files.example.com`.
    pub public_host: Option<String>,
    pub remote_base_url: String,
    pub chunk_size: usize,
    pub session_ttl_hours: i64,
    pub session_sweep_secs: u64,
    pub buffer_pool_size: usize,
}

/// Command-line configuration. Every flag overrides the config file and
/// the matching `PIXSTASH_*` environment variable.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked file storage on top of a public image host")]
pub struct Args {
    /// YAML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (overrides PIXSTASH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PIXSTASH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides PIXSTASH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Login password (overrides PIXSTASH_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Transfer credential offered to the web client (overrides PIXSTASH_AUTH_TOKEN)
    #[arg(long)]
    pub auth_token: Option<String>,

    /// API key for /api/v1 routes (overrides PIXSTASH_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Public URL prefix for share links (overrides PIXSTASH_PUBLIC_HOST)
    #[arg(long)]
    pub public_host: Option<String>,

    /// Base URL of the image host (overrides PIXSTASH_REMOTE_BASE_URL)
    #[arg(long)]
    pub remote_base_url: Option<String>,

    /// Chunk payload size in bytes (overrides PIXSTASH_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Session lifetime in hours (overrides PIXSTASH_SESSION_TTL_HOURS)
    #[arg(long)]
    pub session_ttl_hours: Option<i64>,

    /// Seconds between expired-session sweeps (overrides PIXSTASH_SESSION_SWEEP_SECS)
    #[arg(long)]
    pub session_sweep_secs: Option<u64>,

    /// Maximum chunk buffers in use at once (overrides PIXSTASH_BUFFER_POOL_SIZE)
    #[arg(long)]
    pub buffer_pool_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Contents of the `--config` YAML file.
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_url: Option<String>,
    pub password: Option<String>,
    pub auth_token: Option<String>,
    pub api_key: Option<String>,
    pub public_host: Option<String>,
    pub remote_base_url: Option<String>,
    pub chunk_size: Option<usize>,
    pub session_ttl_hours: Option<i64>,
    pub session_sweep_secs: Option<u64>,
    pub buffer_pool_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl AppConfig {
    /// Parse CLI args, the optional config file and the environment into
    /// AppConfig and the migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let cfg = Self::resolve(&args, |name| env::var(name).ok(), file)?;
        Ok((cfg, args.migrate))
    }

    /// Merge the three sources: CLI flag, then file, then environment, then default.
    pub fn resolve<E>(args: &Args, env: E, file: FileConfig) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let env_str = |key: &str| env(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.is_empty());

        let password = args
            .password
            .clone()
            .or(file.password)
            .or_else(|| env_str("PASSWORD"))
            .unwrap_or_else(|| DEFAULT_PASSWORD.into());

        let cfg = Self {
            host: args
                .host
                .clone()
                .or(file.host)
                .or_else(|| env_str("HOST"))
                .unwrap_or_else(|| DEFAULT_HOST.into()),
            port: pick(args.port, file.port, parse_env(&env_str, "PORT")?, DEFAULT_PORT),
            database_url: args
                .database_url
                .clone()
                .or(file.database_url)
                .or_else(|| env_str("DATABASE_URL"))
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.into()),
            auth_token: args
                .auth_token
                .clone()
                .or(file.auth_token)
                .or_else(|| env_str("AUTH_TOKEN")),
            api_key: args
                .api_key
                .clone()
                .or(file.api_key)
                .or_else(|| env_str("API_KEY"))
                .unwrap_or_else(|| password.clone()),
            public_host: args
                .public_host
                .clone()
                .or(file.public_host)
                .or_else(|| env_str("PUBLIC_HOST"))
                .map(|h| h.trim_end_matches('/').to_string()),
            remote_base_url: args
                .remote_base_url
                .clone()
                .or(file.remote_base_url)
                .or_else(|| env_str("REMOTE_BASE_URL"))
                .unwrap_or_else(|| DEFAULT_REMOTE_BASE_URL.into()),
            chunk_size: pick(
                args.chunk_size,
                file.chunk_size,
                parse_env(&env_str, "CHUNK_SIZE")?,
                DEFAULT_CHUNK_SIZE,
            ),
            session_ttl_hours: pick(
                args.session_ttl_hours,
                file.session_ttl_hours,
                parse_env(&env_str, "SESSION_TTL_HOURS")?,
                DEFAULT_SESSION_TTL_HOURS,
            ),
            session_sweep_secs: pick(
                args.session_sweep_secs,
                file.session_sweep_secs,
                parse_env(&env_str, "SESSION_SWEEP_SECS")?,
                DEFAULT_SESSION_SWEEP_SECS,
            ),
            buffer_pool_size: pick(
                args.buffer_pool_size,
                file.buffer_pool_size,
                parse_env(&env_str, "BUFFER_POOL_SIZE")?,
                DEFAULT_BUFFER_POOL_SIZE,
            ),
            password,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            bail!("password must not be empty");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.buffer_pool_size == 0 {
            bail!("buffer_pool_size must be greater than zero");
        }
        if self.session_ttl_hours <= 0 {
            bail!("session_ttl_hours must be positive");
        }
        if self.session_sweep_secs == 0 {
            bail!("session_sweep_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn pick<T>(cli: Option<T>, file: Option<T>, env: Option<T>, default: T) -> T {
    cli.or(file).or(env).unwrap_or(default)
}

fn parse_env<T, F>(env_str: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match env_str(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("parsing {ENV_PREFIX}{key} value `{value}`: {err}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_with_no_sources() {
        let cfg = AppConfig::resolve(&Args::default(), env_of(&[]), FileConfig::default()).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:37374");
        assert_eq!(cfg.password, "admin");
        assert_eq!(cfg.api_key, "admin");
        assert_eq!(cfg.chunk_size, 6 * 1024 * 1024);
        assert_eq!(cfg.session_ttl_hours, 24);
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn cli_beats_file_beats_env() {
        let env = env_of(&[
            ("PIXSTASH_PORT", "1000"),
            ("PIXSTASH_HOST", "10.0.0.1"),
            ("PIXSTASH_PASSWORD", "from-env"),
        ]);
        let file: FileConfig = serde_yaml::from_str("port: 2000\nhost: 10.0.0.2\n").unwrap();
        let args = Args {
            port: Some(3000),
            ..Args::default()
        };

        let cfg = AppConfig::resolve(&args, env, file).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.host, "10.0.0.2");
        assert_eq!(cfg.password, "from-env");
        assert_eq!(cfg.api_key, "from-env");
    }

    #[test]
    fn bad_env_number_is_an_error() {
        let env = env_of(&[("PIXSTASH_CHUNK_SIZE", "lots")]);
        let err = AppConfig::resolve(&Args::default(), env, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("PIXSTASH_CHUNK_SIZE"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let args = Args {
            chunk_size: Some(0),
            ..Args::default()
        };
        assert!(AppConfig::resolve(&args, env_of(&[]), FileConfig::default()).is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(serde_yaml::from_str::<FileConfig>("prot: 1\n").is_err());
    }

    #[test]
    fn public_host_loses_trailing_slash() {
        let env = env_of(&[("PIXSTASH_PUBLIC_HOST", "https://files.example.com/")]);
        let cfg = AppConfig::resolve(&Args::default(), env, FileConfig::default()).unwrap();
        assert_eq!(cfg.public_host.as_deref(), Some("https://files.example.com"));
    }
}
