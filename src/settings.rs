// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Core configuration

use std::time::Duration;

use serde::Deserialize;

/// Recognized configuration options
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Enable verbose behavior for development builds
    pub debug: bool,

    /// The bridge drives a popup UI surface. When false, interactive
    /// recovery paths fail fast instead of prompting.
    pub popup: bool,

    /// User idle timeout in milliseconds, 0 disables
    pub interaction_timeout: u32,

    /// The embedding host is trusted: permission and confirmation prompts
    /// are skipped and management methods are allowed.
    pub trusted_host: bool,

    /// Keep retrying transport initialization forever instead of failing
    /// the first call.
    pub transport_reconnect: bool,

    /// Allow the WebUSB transport when enumerating devices
    pub webusb: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            popup: true,
            interaction_timeout: 600_000,
            trusted_host: false,
            transport_reconnect: false,
            webusb: false,
        }
    }
}

impl Settings {
    /// Effective interaction timeout; disabled when there is no popup to
    /// time out.
    pub fn effective_interaction_timeout(&self) -> Duration {
        if self.popup {
            Duration::from_millis(u64::from(self.interaction_timeout))
        } else {
            Duration::ZERO
        }
    }
}
