//! Startup configuration.
//!
//! Read from an INI file; every key is required and a missing one aborts
//! startup. The database path is the one setting taken from the
//! environment so deployments can relocate the file without touching the
//! config.

use anyhow::{Context, Result};
use ccs_link::CcsConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.ini";
const DEFAULT_DB_PATH: &str = "gateway.db";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub fcm: CcsConfig,
    pub listen_host: String,
    pub listen_port: u16,
    pub bal_session_id: String,
    pub db_path: String,
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        let ini = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Ini))
            .build()
            .with_context(|| format!("Cannot read configuration file '{path}'"))?;

        let fcm = CcsConfig {
            server_id: require_string(&ini, "FCM_SECTION.server_id")?,
            server_key: require_string(&ini, "FCM_SECTION.server_key")?,
            host: require_string(&ini, "FCM_SECTION.host_address")?,
            port: require_port(&ini, "FCM_SECTION.port_no")?,
        };

        let listen_host = require_string(&ini, "SERVER_SECTION.host_address")?;
        let listen_port = require_port(&ini, "SERVER_SECTION.port_no")?;
        let bal_session_id = require_string(&ini, "BAL_SECTION.session_id")?;

        let db_path =
            std::env::var("GW_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        Ok(Self {
            fcm,
            listen_host,
            listen_port,
            bal_session_id,
            db_path,
        })
    }
}

fn require_string(ini: &config::Config, key: &str) -> Result<String> {
    let value = ini
        .get_string(key)
        .with_context(|| missing(key))?;
    if value.trim().is_empty() {
        anyhow::bail!("{}", missing(key));
    }
    Ok(value)
}

fn require_port(ini: &config::Config, key: &str) -> Result<u16> {
    let value = ini.get_int(key).with_context(|| missing(key))?;
    u16::try_from(value)
        .ok()
        .filter(|&p| p != 0)
        .with_context(|| format!("Config parameter '{key}' is not a valid port: {value}"))
}

fn missing(key: &str) -> String {
    format!("Missing config parameter '{key}'")
}
