// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Device and transport abstractions
//!
//! The core never talks to hardware directly. A [Transport] opens a
//! [DeviceList]; the list owns [Device]s and emits lifecycle events. The
//! core references devices by path and drives them through the capability
//! surface below, generic over the underlying transport (USB HID, WebUSB,
//! bridge daemon).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use tokio::sync::{mpsc, oneshot};

use crate::{error::CoreError, message::EventTag};

/// Device operating modes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceMode {
    Normal,
    Bootloader,
    Initialize,
    Seedless,
}

/// Firmware validity relative to the released range
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FirmwareStatus {
    Valid,
    Outdated,
    Required,
}

/// Semantic firmware version reported by a device
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Feature flags the core inspects
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceFeatures {
    pub vendor: String,
    pub label: String,
    pub initialized: bool,
    pub needs_backup: bool,
}

/// Firmware range violations reported by a method
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FirmwareException {
    FwNotSupported,
    FwNotCompatible,
    FwOutdated,
}

impl FirmwareException {
    /// UI screen shown for the exception
    pub fn ui_tag(&self) -> EventTag {
        match self {
            FirmwareException::FwNotSupported => EventTag::UiFirmwareNotSupported,
            FirmwareException::FwNotCompatible => EventTag::UiFirmwareNotCompatible,
            FirmwareException::FwOutdated => EventTag::UiFirmwareOld,
        }
    }
}

/// Device-mode violations relative to a method's allow/require sets
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ModeException {
    Bootloader,
    NotInBootloader,
    Initialize,
    Seedless,
}

impl ModeException {
    /// UI screen shown for the exception
    pub fn ui_tag(&self) -> EventTag {
        match self {
            ModeException::Bootloader => EventTag::UiBootloader,
            ModeException::NotInBootloader => EventTag::UiNotInBootloader,
            ModeException::Initialize => EventTag::UiInitialize,
            ModeException::Seedless => EventTag::UiSeedless,
        }
    }
}

/// Passphrase reply delivered back into a device session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassphrasePayload {
    /// NFKD-normalized passphrase
    pub passphrase: String,
    /// Enter the passphrase on the device instead
    pub on_device: bool,
    /// Cache the passphrase for the session
    pub save: bool,
}

/// Interaction requests a device raises while a session body runs.
///
/// Requests carrying a `respond` channel block the device protocol until
/// answered; a rejected UI round-trip is delivered as an `Err` so the
/// session fails with the user-facing cause.
#[derive(Debug)]
pub enum DeviceEvent {
    /// Physical confirmation requested, `code` names the prompt
    Button { code: String },
    /// PIN matrix entry requested
    PinRequest {
        respond: oneshot::Sender<Result<String, CoreError>>,
    },
    /// Recovery word requested
    WordRequest {
        respond: oneshot::Sender<Result<String, CoreError>>,
    },
    /// Passphrase requested
    PassphraseRequest {
        respond: oneshot::Sender<Result<PassphrasePayload, CoreError>>,
    },
    /// Passphrase will be entered on the device screen
    PassphraseOnDevice,
    /// Device went away mid-session
    Disconnect,
}

/// Options for opening a device session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    pub keep_session: bool,
    pub use_empty_passphrase: bool,
    pub skip_final_reload: bool,
}

/// Session body executed under exclusive device tenancy
pub type SessionBody = BoxFuture<'static, Result<(), CoreError>>;

/// A physical signing device reachable through the transport.
///
/// Implementations serialize sessions internally: `run` queues until the
/// device is free, and at most one body executes at a time.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable transport path identifying the device
    fn path(&self) -> &str;

    /// A session is currently open on this device
    fn is_running(&self) -> bool;

    /// Features have been read at least once
    fn is_loaded(&self) -> bool;

    /// The open session belongs to this bridge instance
    fn is_used_here(&self) -> bool;

    /// Device enumerates but cannot be read (claimed elsewhere, bad driver)
    fn is_unreadable(&self) -> bool;

    fn features(&self) -> DeviceFeatures;

    fn firmware_status(&self) -> FirmwareStatus;

    fn version(&self) -> DeviceVersion;

    /// Keep the session open after the body finishes
    fn set_keep_session(&self, keep: bool);

    /// Select the passphrase instance for the next session
    fn set_instance(&self, instance: u32);

    /// Expected session state supplied by the caller
    fn set_external_state(&self, state: Option<String>);

    /// Cached session state owned by the device
    fn set_internal_state(&self, state: Option<String>);

    /// Compare the allow/require mode sets against the current mode
    fn has_unexpected_mode(
        &self,
        allow: &[DeviceMode],
        require: &[DeviceMode],
    ) -> Option<ModeException>;

    /// Block until the first feature read of a freshly connected device
    async fn wait_for_first_run(&self);

    /// Validate cached state against the device, returning the device's
    /// actual state when it does not match the expectation.
    async fn validate_state(&self, network: Option<&Value>) -> Result<Option<String>, CoreError>;

    /// Re-initialize the device protocol state
    async fn initialize(&self, use_empty_passphrase: bool) -> Result<(), CoreError>;

    /// Inject an error into the currently running session, preempting it
    async fn call_override(&self, error: CoreError);

    /// Open an exclusive session and execute `body` inside it
    async fn run(&self, body: SessionBody, options: RunOptions) -> Result<(), CoreError>;

    /// Release session resources and detach the event listener
    async fn cleanup(&self);

    /// Attach the per-session interaction listener
    fn attach_listener(&self, listener: mpsc::UnboundedSender<DeviceEvent>);

    /// Abort the running session on behalf of the user
    fn interruption_from_user(&self, error: CoreError);

    /// JSON description sent to the UI surface
    fn to_message_object(&self) -> Value;
}

/// Transport families a device list can enumerate over
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    Hid,
    WebUsb,
    Bridge,
}

/// Transport descriptor reported to callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub outdated: bool,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            kind: String::new(),
            version: String::new(),
            outdated: true,
        }
    }
}

/// Lifecycle events emitted by a [DeviceList]
#[derive(Clone)]
pub enum DeviceListEvent {
    Connect(Arc<dyn Device>),
    ConnectUnacquired(Arc<dyn Device>),
    Disconnect(Arc<dyn Device>),
    Changed,
    TransportStart(Value),
    TransportError(CoreError),
}

impl fmt::Debug for DeviceListEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceListEvent::Connect(d) => write!(f, "Connect({})", d.path()),
            DeviceListEvent::ConnectUnacquired(d) => write!(f, "ConnectUnacquired({})", d.path()),
            DeviceListEvent::Disconnect(d) => write!(f, "Disconnect({})", d.path()),
            DeviceListEvent::Changed => write!(f, "Changed"),
            DeviceListEvent::TransportStart(_) => write!(f, "TransportStart"),
            DeviceListEvent::TransportError(e) => write!(f, "TransportError({e})"),
        }
    }
}

/// Enumerator owning the connected devices
#[async_trait]
pub trait DeviceList: Send + Sync {
    /// Snapshot of known devices
    fn devices(&self) -> Vec<Arc<dyn Device>>;

    /// Resolve a device by path
    fn get(&self, path: &str) -> Option<Arc<dyn Device>>;

    fn transport_kind(&self) -> TransportKind;

    fn transport_info(&self) -> TransportInfo;

    /// Register for lifecycle events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceListEvent>;

    /// Load protocol definitions compatible with the given firmware
    async fn load_protocol(&self, version: &DeviceVersion) -> Result<(), CoreError>;

    /// Load method-specific protocol definitions
    async fn load_custom_messages(&self, messages: Value, force: bool) -> Result<(), CoreError>;

    /// Restore the default protocol definitions
    async fn restore_default_messages(&self) -> Result<(), CoreError>;

    /// Force a transport enumeration to refresh session numbers
    async fn enumerate(&self);

    /// Delay future connection attempts against a misbehaving device
    fn add_auth_penalty(&self, path: &str);

    /// Clear the connection penalty after a successful call
    fn remove_auth_penalty(&self, path: &str);

    /// Release the transport and all devices
    async fn dispose(&self);
}

/// Factory opening a [DeviceList] over a concrete transport stack
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, options: &TransportOptions) -> Result<Arc<dyn DeviceList>, CoreError>;
}

/// Options applied when opening a transport
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransportOptions {
    pub webusb: bool,
    pub debug: bool,
}
