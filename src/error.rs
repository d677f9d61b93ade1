// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Core error type and the string-stable error code taxonomy

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Device-layer failure message for a rejected PIN, matched verbatim to
/// drive the PIN retry loop.
pub const INVALID_PIN_ERROR_MESSAGE: &str = "PIN invalid";

/// Transport-layer failure message for a stale session id, matched verbatim
/// to trigger re-enumeration.
pub const WRONG_PREVIOUS_SESSION_ERROR_MESSAGE: &str = "wrong previous session";

/// Error codes surfaced to callers. The `Display` form of each code is part
/// of the wire contract and must not change.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[non_exhaustive]
pub enum ErrorCode {
    /// No transport layer is available
    #[strum(serialize = "Transport_Missing")]
    TransportMissing,

    /// No device could be resolved for the call
    #[strum(serialize = "Device_NotFound")]
    DeviceNotFound,

    /// Another call already holds the device session
    #[strum(serialize = "Device_CallInProgress")]
    DeviceCallInProgress,

    /// Device disconnected while a call was running
    #[strum(serialize = "Device_Disconnected")]
    DeviceDisconnected,

    /// Device session state does not match the expected state
    #[strum(serialize = "Device_InvalidState")]
    DeviceInvalidState,

    /// Device firmware is outside the range supported by the method
    #[strum(serialize = "Device_FwException")]
    DeviceFwException,

    /// Device mode is incompatible with the method
    #[strum(serialize = "Device_ModeException")]
    DeviceModeException,

    /// Call payload could not be parsed into a method
    #[strum(serialize = "Method_InvalidParameter")]
    MethodInvalidParameter,

    /// Method is not allowed in the running context
    #[strum(serialize = "Method_NotAllowed")]
    MethodNotAllowed,

    /// Call was preempted by a newer call on the same device
    #[strum(serialize = "Method_Override")]
    MethodOverride,

    /// Call was cancelled
    #[strum(serialize = "Method_Cancel")]
    MethodCancel,

    /// Call was interrupted by the user closing the UI
    #[strum(serialize = "Method_Interrupted")]
    MethodInterrupted,

    /// User denied the requested permissions
    #[strum(serialize = "Method_PermissionsNotGranted")]
    MethodPermissionsNotGranted,
}

impl ErrorCode {
    /// Default human-readable message for the code
    fn default_message(&self) -> &'static str {
        use ErrorCode::*;

        match self {
            TransportMissing => "Transport is missing",
            DeviceNotFound => "Device not found",
            DeviceCallInProgress => "Device call in progress",
            DeviceDisconnected => "Device disconnected",
            DeviceInvalidState => "Passphrase is incorrect",
            DeviceFwException => "Wrong device firmware",
            DeviceModeException => "Wrong device mode",
            MethodInvalidParameter => "Invalid parameters",
            MethodNotAllowed => "Method not allowed for this configuration",
            MethodCancel => "Method cancelled",
            MethodInterrupted => "Popup closed",
            MethodOverride => "Call was overridden by another call",
            MethodPermissionsNotGranted => "Permissions not granted",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown error code: {s}")))
    }
}

/// Bridge core error, carrying a stable code and a display message.
///
/// Errors surface to callers exactly once per call, as the payload of a
/// failed response message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    /// Stable code for the error class
    pub code: ErrorCode,
    /// Human readable message, matched verbatim for the two recovery paths
    pub message: String,
}

impl CoreError {
    /// Create an error with an explicit message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an error with the default message for its code
    pub fn code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Interruption raised when the UI surface goes away mid-call
    pub fn interrupted() -> Self {
        Self::code(ErrorCode::MethodInterrupted)
    }

    /// Cancellation with a custom reason
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodCancel, reason)
    }
}

impl From<ErrorCode> for CoreError {
    fn from(code: ErrorCode) -> Self {
        Self::code(code)
    }
}
