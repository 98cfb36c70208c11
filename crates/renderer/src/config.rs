//! Renderer configuration.
//!
//! Built from [`RendererConfig::default`] and optionally overridden from the environment:
//!
//! | Variable | Values |
//! |----------|--------|
//! | `FRAMELINE_VALIDATION` | `1`, `true`, `0`, `false` |
//! | `FRAMELINE_PRESENT_MODE` | `fifo`, `mailbox`, `immediate`, `fifo_relaxed` |

use ash::vk;

use frameline_core::{Error, Result};
use frameline_rhi::swapchain::SwapchainConfig;

/// Enables or disables the validation layer.
pub const VALIDATION_ENV: &str = "FRAMELINE_VALIDATION";
/// Overrides the preferred present mode.
pub const PRESENT_MODE_ENV: &str = "FRAMELINE_PRESENT_MODE";

#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    pub enable_validation: bool,
    /// Color the render pass clears to, RGBA.
    pub clear_color: [f32; 4],
    pub swapchain: SwapchainConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "frameline".to_string(),
            enable_validation: cfg!(debug_assertions),
            clear_color: [0.01, 0.01, 0.01, 1.0],
            swapchain: SwapchainConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable holds an unknown value.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(VALIDATION_ENV) {
            self.enable_validation = parse_bool(VALIDATION_ENV, &value)?;
        }
        if let Some(value) = lookup(PRESENT_MODE_ENV) {
            self.swapchain.present_mode = parse_present_mode(&value)?;
        }
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

/// Parses a present mode name.
pub fn parse_present_mode(value: &str) -> Result<vk::PresentModeKHR> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fifo" => Ok(vk::PresentModeKHR::FIFO),
        "mailbox" => Ok(vk::PresentModeKHR::MAILBOX),
        "immediate" => Ok(vk::PresentModeKHR::IMMEDIATE),
        "fifo_relaxed" => Ok(vk::PresentModeKHR::FIFO_RELAXED),
        other => Err(Error::Config(format!(
            "{PRESENT_MODE_ENV}: unknown present mode {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.clear_color[3], 1.0);
    }

    #[test]
    fn test_overrides_applied() {
        let config = RendererConfig::default()
            .with_overrides(lookup(&[
                (VALIDATION_ENV, "true"),
                (PRESENT_MODE_ENV, "FIFO"),
            ]))
            .unwrap();
        assert!(config.enable_validation);
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::FIFO);

        let config = RendererConfig::default()
            .with_overrides(lookup(&[(VALIDATION_ENV, "0")]))
            .unwrap();
        assert!(!config.enable_validation);
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = RendererConfig::default().with_overrides(lookup(&[])).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn test_unknown_values_are_config_errors() {
        let err = RendererConfig::default()
            .with_overrides(lookup(&[(PRESENT_MODE_ENV, "vsync")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("vsync")));

        let err = RendererConfig::default()
            .with_overrides(lookup(&[(VALIDATION_ENV, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
