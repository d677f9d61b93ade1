// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Device event bridge
//!
//! Turns interaction requests raised inside a device session into UI
//! round-trips: button prompts, PIN matrix entry, recovery words, and
//! passphrases. One bridge task runs per session; it ends when the session
//! listener is detached or the call is torn down.

use std::sync::{Arc, Weak};

use log::debug;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use unicode_normalization::UnicodeNormalization;

use crate::{
    core::CoreInner,
    device::{Device, DeviceEvent, PassphrasePayload},
    error::CoreError,
    message::{CoreMessage, EventTag},
    method::Method,
};

/// Button prompt shown while the device displays an address
const ADDRESS_BUTTON_REQUEST: &str = "ButtonRequest_Address";

pub(crate) async fn run_bridge(
    core: Weak<CoreInner>,
    device: Arc<dyn Device>,
    method: Arc<dyn Method>,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else { return };
        match event {
            DeviceEvent::Button { code } => on_button(&core, &device, &method, &code).await,
            DeviceEvent::PinRequest { respond } => on_pin(&core, &device, respond).await,
            DeviceEvent::WordRequest { respond } => on_word(&core, &device, respond).await,
            DeviceEvent::PassphraseRequest { respond } => {
                if method.info().use_empty_passphrase {
                    let _ = respond.send(Ok(PassphrasePayload {
                        passphrase: String::new(),
                        on_device: false,
                        save: false,
                    }));
                } else {
                    on_passphrase(&core, &device, respond).await;
                }
            }
            DeviceEvent::PassphraseOnDevice => {
                core.emit(CoreMessage::ui(
                    EventTag::UiRequestPassphraseOnDevice,
                    Some(json!({ "device": device.to_message_object() })),
                ));
            }
            DeviceEvent::Disconnect => {
                // surfaced through the device list, nothing to do per session
                debug!("device {} disconnected mid-session", device.path());
            }
        }
    }
}

async fn on_button(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    method: &Arc<dyn Method>,
    code: &str,
) {
    core.restart_interaction_timeout();

    let device_object = device.to_message_object();

    // address display without a UI method renders inline, no popup needed
    if code == ADDRESS_BUTTON_REQUEST && !method.info().use_ui {
        core.emit(CoreMessage::device(
            EventTag::DeviceButton,
            json!({ "device": device_object, "code": code }),
        ));
        core.emit(CoreMessage::ui(
            EventTag::UiRequestButton,
            Some(json!({ "device": device_object, "code": code })),
        ));
        core.emit(CoreMessage::ui(
            EventTag::UiAddressValidation,
            Some(json!({ "device": device_object })),
        ));
        return;
    }

    if core.popup_promise(true).wait().await.is_err() {
        return;
    }

    let data = method.button_request_data(code);
    core.emit(CoreMessage::device(
        EventTag::DeviceButton,
        json!({ "device": device_object, "code": code }),
    ));
    core.emit(CoreMessage::ui(
        EventTag::UiRequestButton,
        Some(json!({ "device": device_object, "code": code, "data": data })),
    ));
}

async fn on_pin(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    respond: oneshot::Sender<Result<String, CoreError>>,
) {
    let result = ui_round_trip(
        core,
        device,
        EventTag::UiRequestPin,
        EventTag::UiReceivePin,
    )
    .await
    .map(|payload| payload.as_str().unwrap_or_default().to_string());
    let _ = respond.send(result);
}

async fn on_word(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    respond: oneshot::Sender<Result<String, CoreError>>,
) {
    let result = ui_round_trip(
        core,
        device,
        EventTag::UiRequestWord,
        EventTag::UiReceiveWord,
    )
    .await
    .map(|payload| payload.as_str().unwrap_or_default().to_string());
    let _ = respond.send(result);
}

async fn on_passphrase(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    respond: oneshot::Sender<Result<PassphrasePayload, CoreError>>,
) {
    let result = ui_round_trip(
        core,
        device,
        EventTag::UiRequestPassphrase,
        EventTag::UiReceivePassphrase,
    )
    .await
    .map(|payload| {
        let value = payload
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default();
        PassphrasePayload {
            // the device expects NFKD, whatever the keyboard produced
            passphrase: value.nfkd().collect(),
            on_device: payload
                .get("passphraseOnDevice")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            save: payload.get("save").and_then(Value::as_bool).unwrap_or(true),
        }
    });
    let _ = respond.send(result);
}

/// Await the popup, emit a request, and wait for the matching response
async fn ui_round_trip(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    request: EventTag,
    response: EventTag,
) -> Result<Value, CoreError> {
    core.popup_promise(true).wait().await?;

    let promise = core.create_ui_promise(response, Some(device));
    core.emit(CoreMessage::ui(
        request,
        Some(json!({ "device": device.to_message_object() })),
    ));

    let result = promise.wait().await;
    core.remove_ui_promise(&promise);
    Ok(result?.payload)
}
