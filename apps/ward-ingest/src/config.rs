use crate::layout::{PipelineLayout, Profile};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/ward-ingest/config.json";

fn setup_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    lookup("WARD_INGEST_SETUP_CONFIG_PATH")
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    ward_id: Option<i64>,
    #[serde(default)]
    patient_id: Option<i64>,
    #[serde(default)]
    backup_dir: Option<String>,
    /// Replaces the profile preset entirely.
    #[serde(default)]
    pipeline: Option<PipelineLayout>,
}

/// A missing file means "no overrides". A file that is present but unreadable or malformed
/// aborts startup rather than silently running the built-in preset.
fn load_setup_config_overrides(path: &Path) -> Result<Option<SetupConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = std::fs::read(path)
        .with_context(|| format!("failed to read setup config {}", path.display()))?;
    let overrides = simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("failed to parse setup config {}", path.display()))?;
    Ok(Some(overrides))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_or<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match non_empty(lookup(key).as_deref()) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{key}={raw:?} is not a valid value")),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub profile: Profile,
    pub ward_id: i64,
    pub patient_id: i64,
    pub backup_dir: PathBuf,
    pub backup_enabled: bool,
    pub persist_timeout_ms: u64,
    pub queue_capacity: usize,
    pub otlp_endpoint: Option<String>,
    /// Already validated.
    pub layout: PipelineLayout,
    pub layout_from_setup: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| env::var(key).ok();
        let overrides = load_setup_config_overrides(&setup_config_path(&lookup))?;
        Self::from_sources(&lookup, overrides.unwrap_or_default())
    }

    /// Environment wins over the setup file, which wins over built-in defaults.
    fn from_sources(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Result<Self> {
        let env_value = |key: &str| non_empty(lookup(key).as_deref());

        let database_url = env_value("WARD_INGEST_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| non_empty(overrides.database_url.as_deref()))
            .context("WARD_INGEST_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = env_value("WARD_INGEST_MQTT_HOST")
            .or_else(|| non_empty(overrides.mqtt_host.as_deref()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = parse_or(
            lookup,
            "WARD_INGEST_MQTT_PORT",
            overrides.mqtt_port.filter(|port| *port != 0).unwrap_or(1883),
        )?;
        let mqtt_username = env_value("WARD_INGEST_MQTT_USERNAME")
            .or_else(|| non_empty(overrides.mqtt_username.as_deref()));
        let mqtt_password = env_value("WARD_INGEST_MQTT_PASSWORD")
            .or_else(|| non_empty(overrides.mqtt_password.as_deref()));
        let mqtt_client_id = env_value("WARD_INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("ward-ingest-{}", std::process::id()));
        let mqtt_keepalive_secs = parse_or(lookup, "WARD_INGEST_MQTT_KEEPALIVE_SECS", 60u64)?;

        let profile: Profile = env_value("WARD_INGEST_PROFILE")
            .or_else(|| non_empty(overrides.profile.as_deref()))
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or(Profile::Pico);
        let ward_id = parse_or(lookup, "WARD_INGEST_WARD_ID", overrides.ward_id.unwrap_or(1))?;
        let patient_id = parse_or(
            lookup,
            "WARD_INGEST_PATIENT_ID",
            overrides.patient_id.unwrap_or(2),
        )?;

        let backup_dir = env_value("WARD_INGEST_BACKUP_DIR")
            .or_else(|| non_empty(overrides.backup_dir.as_deref()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("sensor_logs"));
        let backup_enabled = env_value("WARD_INGEST_BACKUP_ENABLED")
            .map(|value| parse_flag(&value))
            .unwrap_or(true);
        let persist_timeout_ms = parse_or(lookup, "WARD_INGEST_PERSIST_TIMEOUT_MS", 5000u64)?;
        let queue_capacity = parse_or(lookup, "WARD_INGEST_QUEUE_CAPACITY", 256usize)?;
        let db_pool_size = parse_or(lookup, "WARD_INGEST_DB_POOL_SIZE", 5u32)?;
        let otlp_endpoint = env_value("OTEL_EXPORTER_OTLP_ENDPOINT");

        if queue_capacity == 0 {
            bail!("WARD_INGEST_QUEUE_CAPACITY must be at least 1");
        }
        if persist_timeout_ms == 0 {
            bail!("WARD_INGEST_PERSIST_TIMEOUT_MS must be at least 1");
        }

        let layout_from_setup = overrides.pipeline.is_some();
        let layout = match overrides.pipeline {
            Some(layout) => layout,
            None => match profile {
                Profile::Pico => PipelineLayout::pico(ward_id, patient_id),
                Profile::Adafruit => {
                    let username = mqtt_username
                        .as_deref()
                        .context("the adafruit profile needs WARD_INGEST_MQTT_USERNAME for its feed names")?;
                    PipelineLayout::adafruit(username, ward_id, patient_id)
                }
            },
        };
        layout
            .validate()
            .context("pipeline layout is invalid")?;

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            profile,
            ward_id,
            patient_id,
            backup_dir,
            backup_enabled,
            persist_timeout_ms,
            queue_capacity,
            otlp_endpoint,
            layout,
            layout_from_setup,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

fn normalize_database_url(url: String) -> String {
    for driver in ["postgresql+psycopg://", "postgresql+psycopg2://", "postgresql+asyncpg://"] {
        if let Some(stripped) = url.strip_prefix(driver) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}
