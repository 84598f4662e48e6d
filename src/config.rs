use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// Session supervision bounds (ms)
const HANDSHAKE_MIN_MS: u64 = 20_000;
const HANDSHAKE_MAX_MS: u64 = 300_000;
const PING_MIN_MS: u64 = 1_000;
const PING_MAX_MS: u64 = 120_000;
const HB_TIMEOUT_MARGIN_MS: u64 = 3_000;
const HB_TIMEOUT_MAX_MS: u64 = 180_000;
const RESTART_MIN_MS: u64 = 30_000;
const RESTART_MAX_MS: u64 = 600_000;
const RESTART_COUNT_MIN: u32 = 3;

// Transaction bounds (ms)
pub const MT_SMS_TIMEOUT_MIN_MS: u64 = 5_000;
pub const MT_SMS_TIMEOUT_MAX_MS: u64 = 600_000;
pub const USSD_TIMEOUT_MIN_MS: u64 = 30_000;

/// Station location area identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaiConfig {
    pub mcc: String,
    pub mnc: String,
    pub lac: u16,
}

impl Default for LaiConfig {
    fn default() -> Self {
        Self {
            mcc: "001".into(),
            mnc: "01".into(),
            lac: 1000,
        }
    }
}

impl LaiConfig {
    pub fn plmn(&self) -> String {
        format!("{}{}", self.mcc, self.mnc)
    }

    /// Hex encoded location area code as carried in the LAI IE.
    pub fn lac_hex(&self) -> String {
        format!("{:04X}", self.lac)
    }

    /// Comparable key, `mccmnc_lac`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.plmn(), self.lac_hex())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BtsConfig {
    pub lai: LaiConfig,
    pub handshake_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub restart_max: u32,
    pub mt_sms_timeout_ms: u64,
    pub ussd_timeout_ms: u64,
    pub conn_idle_ms: u64,
    pub conn_idle_mt_sms_ms: u64,
    pub t305_ms: u64,
    pub t308_ms: u64,
    pub t313_ms: u64,
    pub tmsi_expire_secs: u64,
    pub ask_imei: bool,
    pub accept_calls: bool,
    pub ue_file: Option<PathBuf>,
    pub save_tmsi: bool,
}

impl Default for BtsConfig {
    fn default() -> Self {
        Self {
            lai: LaiConfig::default(),
            handshake_timeout_ms: 60_000,
            ping_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            restart_delay_ms: 120_000,
            restart_max: 10,
            mt_sms_timeout_ms: 300_000,
            ussd_timeout_ms: 600_000,
            conn_idle_ms: 2_000,
            conn_idle_mt_sms_ms: 5_000,
            t305_ms: 30_000,
            t308_ms: 5_000,
            t313_ms: 5_000,
            tmsi_expire_secs: 864_000,
            ask_imei: true,
            accept_calls: true,
            ue_file: None,
            save_tmsi: true,
        }
    }
}

impl BtsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and clamp a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg = Self::from_json(&text)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: BtsConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        cfg.clamp();
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lai.mcc.len() != 3 || !self.lai.mcc.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                field: "lai.mcc",
                reason: format!("'{}' is not a 3 digit country code", self.lai.mcc),
            });
        }
        if !(2..=3).contains(&self.lai.mnc.len()) || !self.lai.mnc.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                field: "lai.mnc",
                reason: format!("'{}' is not a 2 or 3 digit network code", self.lai.mnc),
            });
        }
        Ok(())
    }

    /// Force every timer into its legal range.
    pub fn clamp(&mut self) {
        self.handshake_timeout_ms = clamp_logged(
            "handshake_timeout_ms",
            self.handshake_timeout_ms,
            HANDSHAKE_MIN_MS,
            HANDSHAKE_MAX_MS,
        );
        self.ping_interval_ms = clamp_logged("ping_interval_ms", self.ping_interval_ms, PING_MIN_MS, PING_MAX_MS);
        self.heartbeat_timeout_ms = clamp_logged(
            "heartbeat_timeout_ms",
            self.heartbeat_timeout_ms,
            self.ping_interval_ms + HB_TIMEOUT_MARGIN_MS,
            HB_TIMEOUT_MAX_MS,
        );
        self.restart_delay_ms = clamp_logged("restart_delay_ms", self.restart_delay_ms, RESTART_MIN_MS, RESTART_MAX_MS);
        if self.restart_max < RESTART_COUNT_MIN {
            warn!("restart_max {} raised to {}", self.restart_max, RESTART_COUNT_MIN);
            self.restart_max = RESTART_COUNT_MIN;
        }
        self.mt_sms_timeout_ms = clamp_logged(
            "mt_sms_timeout_ms",
            self.mt_sms_timeout_ms,
            MT_SMS_TIMEOUT_MIN_MS,
            MT_SMS_TIMEOUT_MAX_MS,
        );
        if self.ussd_timeout_ms < USSD_TIMEOUT_MIN_MS {
            warn!("ussd_timeout_ms {} raised to {}", self.ussd_timeout_ms, USSD_TIMEOUT_MIN_MS);
            self.ussd_timeout_ms = USSD_TIMEOUT_MIN_MS;
        }
    }
}

fn clamp_logged(name: &str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} {} out of range, using {}", name, value, clamped);
    }
    clamped
}
