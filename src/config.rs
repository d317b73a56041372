// =============================================================================
// CONFIGURATION - Load settings from rhi.toml
// =============================================================================
//
// Every section is optional and every field has a default, so a missing file
// or a partial one still yields a usable configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::HeadlessOptions;
use crate::rhi::{BackendKind, DeviceDesc, PresentMode, SwapChainDesc};

pub const DEFAULT_CONFIG_PATH: &str = "rhi.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub swap_chain: SwapChainConfig,
    pub logging: LoggingConfig,
    pub headless: HeadlessConfig,
}

/// Device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `None` lets the platform pick
    pub backend: Option<BackendKind>,
    pub app_name: String,
    pub validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: None,
            app_name: "tri-rhi".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

/// Swap chain settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SwapChainConfig {
    pub present_mode: String,
    pub image_count: u32,
    pub frames_in_flight: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            image_count: 0,
            frames_in_flight: 2,
            width: 1280,
            height: 720,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, `RUST_LOG` overrides it
    pub level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: "rhi.log".to_string(),
        }
    }
}

/// Simulated device knobs for the headless backend
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HeadlessConfig {
    pub adapter_name: Option<String>,
    pub memory_budget: Option<u64>,
    pub lose_device_after_submissions: Option<u64>,
}

impl Config {
    /// Load `rhi.toml`, falling back to defaults if it cannot be used
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path. A missing file gives the
    /// defaults; an unreadable or malformed one is an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Present mode from its config string; unknown names fall back to FIFO
    pub fn present_mode(&self) -> PresentMode {
        match self.swap_chain.present_mode.to_lowercase().as_str() {
            "immediate" => PresentMode::Immediate,
            "mailbox" => PresentMode::Mailbox,
            "fifo" => PresentMode::Fifo,
            "fifo_relaxed" => PresentMode::FifoRelaxed,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.swap_chain.present_mode
                );
                PresentMode::Fifo
            }
        }
    }

    pub fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            backend: self.device.backend,
            app_name: self.device.app_name.clone(),
            validation: self.device.validation,
            headless: HeadlessOptions {
                adapter_name: self.headless.adapter_name.clone(),
                memory_budget: self.headless.memory_budget,
                lose_device_after_submissions: self.headless.lose_device_after_submissions,
            },
        }
    }

    pub fn swap_chain_desc(&self) -> SwapChainDesc {
        SwapChainDesc {
            width: self.swap_chain.width,
            height: self.swap_chain.height,
            present_mode: self.present_mode(),
            image_count: self.swap_chain.image_count,
            frames_in_flight: self.swap_chain.frames_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [device]
            backend = "headless"

            [swap_chain]
            present_mode = "mailbox"
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(config.device.backend, Some(BackendKind::Headless));
        assert_eq!(config.device.app_name, "tri-rhi");

        let desc = config.swap_chain_desc();
        assert_eq!(desc.present_mode, PresentMode::Mailbox);
        assert_eq!((desc.width, desc.height), (640, 720));
        assert_eq!(desc.frames_in_flight, 2);
    }

    #[test]
    fn unknown_present_mode_is_fifo() {
        let mut config = Config::default();
        config.swap_chain.present_mode = "triple".to_string();
        assert_eq!(config.present_mode(), PresentMode::Fifo);
    }

    #[test]
    fn headless_section_reaches_device_desc() {
        let config = Config::parse(
            r#"
            [headless]
            adapter_name = "test adapter"
            memory_budget = 4096
            "#,
        )
        .unwrap();
        let desc = config.device_desc();
        assert_eq!(desc.headless.adapter_name.as_deref(), Some("test adapter"));
        assert_eq!(desc.headless.memory_budget, Some(4096));
        assert_eq!(desc.headless.lose_device_after_submissions, None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[device\nbackend = 3").is_err());
        assert!(Config::load_from_path("definitely/not/here.toml").is_ok());
    }
}
