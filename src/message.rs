// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Message envelope exchanged with the caller frame and the UI surface
//!
//! Every message crossing the bridge boundary is a [CoreMessage]: a tagged,
//! JSON-serializable envelope with an event class, an event tag, and an
//! optional payload. Response messages additionally carry the request id and
//! a success flag.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};

use crate::error::CoreError;

/// Event classes of the envelope
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEvent {
    /// Inbound control messages (method calls, popup lifecycle)
    #[serde(rename = "CORE_EVENT")]
    Core,
    /// Terminal per-call response, exactly one per accepted call
    #[serde(rename = "RESPONSE_EVENT")]
    Response,
    /// Informational device lifecycle events
    #[serde(rename = "DEVICE_EVENT")]
    Device,
    /// Informational transport lifecycle events
    #[serde(rename = "TRANSPORT_EVENT")]
    Transport,
    /// Interactive UI round-trip events
    #[serde(rename = "UI_EVENT")]
    Ui,
}

/// Event tags carried in the `type` field of the envelope.
///
/// The serialized string form of each tag is part of the wire contract.
/// Unrecognized inbound tags map to [EventTag::Unknown] and are dropped by
/// the gateway.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[non_exhaustive]
pub enum EventTag {
    // inbound, caller frame
    #[strum(serialize = "IFRAME.CALL")]
    IframeCall,

    // inbound, popup lifecycle
    #[strum(serialize = "POPUP.HANDSHAKE")]
    PopupHandshake,
    #[strum(serialize = "POPUP.CLOSED")]
    PopupClosed,

    // outbound, popup lifecycle
    #[strum(serialize = "POPUP.CANCEL_POPUP_REQUEST")]
    PopupCancelPopupRequest,
    #[strum(serialize = "UI.REQUEST_UI_WINDOW")]
    UiRequestUiWindow,
    #[strum(serialize = "UI.CLOSE_UI_WINDOW")]
    UiCloseUiWindow,

    // outbound, interactive UI requests
    #[strum(serialize = "UI.SELECT_DEVICE")]
    UiSelectDevice,
    #[strum(serialize = "UI.TRANSPORT")]
    UiTransport,
    #[strum(serialize = "UI.REQUEST_BUTTON")]
    UiRequestButton,
    #[strum(serialize = "UI.REQUEST_PIN")]
    UiRequestPin,
    #[strum(serialize = "UI.INVALID_PIN")]
    UiInvalidPin,
    #[strum(serialize = "UI.REQUEST_WORD")]
    UiRequestWord,
    #[strum(serialize = "UI.REQUEST_PASSPHRASE")]
    UiRequestPassphrase,
    #[strum(serialize = "UI.REQUEST_PASSPHRASE_ON_DEVICE")]
    UiRequestPassphraseOnDevice,
    #[strum(serialize = "UI.INVALID_PASSPHRASE")]
    UiInvalidPassphrase,
    #[strum(serialize = "UI.DEVICE_NEEDS_BACKUP")]
    UiDeviceNeedsBackup,
    #[strum(serialize = "UI.FIRMWARE_OUTDATED")]
    UiFirmwareOutdated,
    #[strum(serialize = "UI.ADDRESS_VALIDATION")]
    UiAddressValidation,
    #[strum(serialize = "UI.REQUEST_PERMISSION")]
    UiRequestPermission,
    #[strum(serialize = "UI.REQUEST_CONFIRMATION")]
    UiRequestConfirmation,

    // outbound, firmware range exceptions
    #[strum(serialize = "UI.FIRMWARE_OLD")]
    UiFirmwareOld,
    #[strum(serialize = "UI.FIRMWARE_NOT_SUPPORTED")]
    UiFirmwareNotSupported,
    #[strum(serialize = "UI.FIRMWARE_NOT_COMPATIBLE")]
    UiFirmwareNotCompatible,

    // outbound, unexpected device mode
    #[strum(serialize = "UI.BOOTLOADER")]
    UiBootloader,
    #[strum(serialize = "UI.NOT_IN_BOOTLOADER")]
    UiNotInBootloader,
    #[strum(serialize = "UI.INITIALIZE")]
    UiInitialize,
    #[strum(serialize = "UI.SEEDLESS")]
    UiSeedless,

    // inbound, UI responses
    #[strum(serialize = "UI.RECEIVE_DEVICE")]
    UiReceiveDevice,
    #[strum(serialize = "UI.RECEIVE_PIN")]
    UiReceivePin,
    #[strum(serialize = "UI.RECEIVE_WORD")]
    UiReceiveWord,
    #[strum(serialize = "UI.RECEIVE_PASSPHRASE")]
    UiReceivePassphrase,
    #[strum(serialize = "UI.RECEIVE_PERMISSION")]
    UiReceivePermission,
    #[strum(serialize = "UI.RECEIVE_CONFIRMATION")]
    UiReceiveConfirmation,
    #[strum(serialize = "UI.CHANGE_ACCOUNT")]
    UiChangeAccount,
    #[strum(serialize = "UI.INVALID_PASSPHRASE_ACTION")]
    UiInvalidPassphraseAction,
    #[strum(serialize = "UI.CUSTOM_MESSAGE_RESPONSE")]
    UiCustomMessageResponse,
    #[strum(serialize = "UI.LOGIN_CHALLENGE_RESPONSE")]
    UiLoginChallengeResponse,

    // device lifecycle mirrors
    #[strum(serialize = "DEVICE.CONNECT")]
    DeviceConnect,
    #[strum(serialize = "DEVICE.CONNECT_UNACQUIRED")]
    DeviceConnectUnacquired,
    #[strum(serialize = "DEVICE.DISCONNECT")]
    DeviceDisconnect,
    #[strum(serialize = "DEVICE.CHANGED")]
    DeviceChanged,
    #[strum(serialize = "DEVICE.BUTTON")]
    DeviceButton,

    // transport lifecycle mirrors
    #[strum(serialize = "TRANSPORT.START")]
    TransportStart,
    #[strum(serialize = "TRANSPORT.ERROR")]
    TransportError,
    #[strum(serialize = "TRANSPORT.DISABLE_WEBUSB")]
    TransportDisableWebusb,

    // terminal response
    #[strum(serialize = "RESPONSE")]
    Response,

    /// Catch-all for tags this build does not recognize
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl EventTag {
    /// Tags accepted from an untrusted origin; everything else is dropped
    /// silently by the gateway.
    pub fn is_safe_for_untrusted(&self) -> bool {
        matches!(
            self,
            EventTag::IframeCall
                | EventTag::PopupClosed
                | EventTag::UiCustomMessageResponse
                | EventTag::UiLoginChallengeResponse
                | EventTag::TransportDisableWebusb
        )
    }

    /// Inbound tags that resolve a pending UI round-trip
    pub fn is_ui_response(&self) -> bool {
        matches!(
            self,
            EventTag::UiReceiveDevice
                | EventTag::UiReceivePin
                | EventTag::UiReceiveWord
                | EventTag::UiReceivePassphrase
                | EventTag::UiReceivePermission
                | EventTag::UiReceiveConfirmation
                | EventTag::UiChangeAccount
                | EventTag::UiInvalidPassphraseAction
                | EventTag::UiCustomMessageResponse
                | EventTag::UiLoginChallengeResponse
        )
    }
}

impl Serialize for EventTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(EventTag::Unknown))
    }
}

/// Tagged message envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoreMessage {
    /// Event class
    pub event: MessageEvent,

    /// Event tag
    #[serde(rename = "type")]
    pub message_type: EventTag,

    /// Request id, present on calls and responses
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u32>,

    /// Event payload
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,

    /// Success flag, present on responses only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub success: Option<bool>,
}

impl CoreMessage {
    /// Inbound method call envelope
    pub fn call(id: u32, payload: Value) -> Self {
        Self {
            event: MessageEvent::Core,
            message_type: EventTag::IframeCall,
            id: Some(id),
            payload: Some(payload),
            success: None,
        }
    }

    /// UI event
    pub fn ui(tag: EventTag, payload: Option<Value>) -> Self {
        Self {
            event: MessageEvent::Ui,
            message_type: tag,
            id: None,
            payload,
            success: None,
        }
    }

    /// Device lifecycle event
    pub fn device(tag: EventTag, payload: Value) -> Self {
        Self {
            event: MessageEvent::Device,
            message_type: tag,
            id: None,
            payload: Some(payload),
            success: None,
        }
    }

    /// Transport lifecycle event
    pub fn transport(tag: EventTag, payload: Value) -> Self {
        Self {
            event: MessageEvent::Transport,
            message_type: tag,
            id: None,
            payload: Some(payload),
            success: None,
        }
    }

    /// Successful response for a call
    pub fn response_ok(id: u32, payload: Value) -> Self {
        Self {
            event: MessageEvent::Response,
            message_type: EventTag::Response,
            id: Some(id),
            payload: Some(payload),
            success: Some(true),
        }
    }

    /// Failed response for a call, wrapping the error code and message
    pub fn response_err(id: u32, error: &CoreError) -> Self {
        Self {
            event: MessageEvent::Response,
            message_type: EventTag::Response,
            id: Some(id),
            payload: Some(json!({
                "error": error.message,
                "code": error.code.to_string(),
            })),
            success: Some(false),
        }
    }

    /// True for terminal response messages
    pub fn is_response(&self) -> bool {
        self.event == MessageEvent::Response
    }
}
