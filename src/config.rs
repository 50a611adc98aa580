use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vidtube-env";
pub const DEFAULT_VIDTUBE_PORT: u16 = 8000;
pub const DEFAULT_VIDTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PUBLIC_MEDIA_URL: &str = "/media";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_path: Option<PathBuf>,
    pub media_root: Option<PathBuf>,
    pub vidtube_port: Option<u16>,
    pub vidtube_host: Option<String>,
    pub public_media_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_path: PathBuf,
    pub media_root: PathBuf,
    pub vidtube_port: u16,
    pub vidtube_host: String,
    pub public_media_url: String,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    parse_env_config(&content)
        .with_context(|| format!("Parsing {}", path.display()))
        .map(Some)
}

fn parse_env_config(content: &str) -> Result<EnvConfig> {
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key.trim() {
                "DATABASE_PATH" => cfg.database_path = Some(PathBuf::from(value)),
                "MEDIA_ROOT" => cfg.media_root = Some(PathBuf::from(value)),
                "VIDTUBE_PORT" => cfg.vidtube_port = Some(parse_port(value)?),
                "VIDTUBE_HOST" => {
                    if !value.is_empty() {
                        cfg.vidtube_host = Some(value.to_string());
                    }
                }
                "PUBLIC_MEDIA_URL" => {
                    if !value.is_empty() {
                        cfg.public_media_url = Some(value.trim_end_matches('/').to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(cfg)
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .with_context(|| format!("VIDTUBE_PORT `{value}` is not a port number"))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// `VIDTUBE_PORT` in the process environment wins over the file.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    let env_port = std::env::var("VIDTUBE_PORT")
        .ok()
        .map(|value| parse_port(&value))
        .transpose()?;
    resolve(cfg, env_port, path)
}

fn resolve(cfg: EnvConfig, env_port: Option<u16>, path: &Path) -> Result<RuntimeConfig> {
    let database_path = cfg
        .database_path
        .ok_or_else(|| anyhow!("DATABASE_PATH not set in {}", path.display()))?;
    let media_root = cfg
        .media_root
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set in {}", path.display()))?;
    Ok(RuntimeConfig {
        database_path,
        media_root,
        vidtube_port: env_port.or(cfg.vidtube_port).unwrap_or(DEFAULT_VIDTUBE_PORT),
        vidtube_host: cfg
            .vidtube_host
            .unwrap_or_else(|| DEFAULT_VIDTUBE_HOST.to_string()),
        public_media_url: cfg
            .public_media_url
            .unwrap_or_else(|| DEFAULT_PUBLIC_MEDIA_URL.to_string()),
    })
}
