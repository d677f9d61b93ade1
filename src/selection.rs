// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Device selection
//!
//! Resolves the device a call runs against: an explicit path wins, a lone
//! readable device is picked silently, anything else goes through the UI
//! picker. List changes while the picker is open are reflected live.

use std::sync::Arc;

use log::debug;
use serde_json::{json, Value};

use crate::{
    core::CoreInner,
    deferred::UiResponse,
    device::{Device, TransportKind},
    error::{CoreError, ErrorCode},
    message::{CoreMessage, EventTag},
    method::Method,
};

impl CoreInner {
    /// Resolve a device for the method, prompting the user if needed
    pub(crate) async fn select_device(
        &self,
        method: &Arc<dyn Method>,
    ) -> Result<Arc<dyn Device>, CoreError> {
        let list = self
            .device_list()
            .ok_or_else(|| CoreError::code(ErrorCode::TransportMissing))?;

        let is_webusb = list.transport_kind() == TransportKind::WebUsb;
        let mut show_picker = is_webusb;
        let mut device: Option<Arc<dyn Device>> = None;

        if let Some(path) = &method.info().device_path {
            device = list.get(path);
            show_picker = match &device {
                Some(d) => d.is_unreadable(),
                // the requested device is gone, ask the user
                None => true,
            };
        } else {
            let devices = list.devices();
            if devices.len() == 1 && !is_webusb {
                let d = devices.into_iter().next().expect("length checked");
                show_picker = d.is_unreadable();
                device = Some(d);
            } else {
                show_picker = true;
            }
        }

        if show_picker {
            let promise = self.create_ui_promise(EventTag::UiReceiveDevice, None);
            self.popup_promise(true).wait().await?;

            // the list may have settled while the popup was opening
            let devices = list.devices();
            let usable: Vec<_> = devices
                .iter()
                .filter(|d| !d.is_unreadable())
                .cloned()
                .collect();

            if usable.len() == 1 && !is_webusb {
                device = Some(usable.into_iter().next().expect("length checked"));
                self.remove_ui_promise(&promise);
            } else {
                self.emit(CoreMessage::ui(
                    EventTag::UiSelectDevice,
                    Some(select_device_payload(&devices, is_webusb)),
                ));

                let response = promise.wait().await;
                self.remove_ui_promise(&promise);
                let response = response?;

                let remember = response
                    .payload
                    .get("remember")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(path) = response
                    .payload
                    .pointer("/device/path")
                    .and_then(Value::as_str)
                {
                    debug!("user selected device {path} (remember: {remember})");
                    device = list.get(path);
                    self.state().preferred_device =
                        remember.then(|| path.to_string());
                }
            }
        }

        device.ok_or_else(|| CoreError::code(ErrorCode::DeviceNotFound))
    }

    /// The device list changed while a picker round-trip may be pending.
    ///
    /// When the list collapses to a single usable non-WebUSB device the
    /// pending selection resolves synthetically; otherwise the picker is
    /// refreshed with the new list.
    pub(crate) fn on_device_selection_changed(&self) {
        let Some(promise) = self.find_ui_promise(EventTag::UiReceiveDevice) else {
            return;
        };
        let Some(list) = self.device_list() else {
            return;
        };

        let is_webusb = list.transport_kind() == TransportKind::WebUsb;
        let devices = list.devices();
        let usable: Vec<_> = devices
            .iter()
            .filter(|d| !d.is_unreadable())
            .cloned()
            .collect();

        if !is_webusb && usable.len() == 1 {
            let device = usable.into_iter().next().expect("length checked");
            debug!("selection collapsed to {}", device.path());
            promise.resolve(UiResponse {
                event: EventTag::UiReceiveDevice,
                payload: json!({
                    "remember": false,
                    "device": device.to_message_object(),
                }),
            });
            self.remove_ui_promise(&promise);
        } else {
            self.emit(CoreMessage::ui(
                EventTag::UiSelectDevice,
                Some(select_device_payload(&devices, is_webusb)),
            ));
        }
    }

    /// A device disconnected: drop stickiness, settle bound round-trips,
    /// and refresh any pending selection.
    pub(crate) fn on_device_disconnect(&self, device: &Arc<dyn Device>) {
        {
            let mut state = self.state();
            if state.preferred_device.as_deref() == Some(device.path()) {
                state.preferred_device = None;
            }
        }

        let bound: Vec<_> = self
            .state()
            .ui_promises
            .iter()
            .filter(|p| p.device_path() == Some(device.path()))
            .cloned()
            .collect();

        if !bound.is_empty() {
            debug!("settling {} promise(s) bound to {}", bound.len(), device.path());
            for promise in bound {
                promise.resolve(UiResponse {
                    event: EventTag::DeviceDisconnect,
                    payload: Value::Null,
                });
                self.remove_ui_promise(&promise);
            }
            self.emit(CoreMessage::ui(EventTag::UiCloseUiWindow, None));
        }

        self.on_device_selection_changed();
    }
}

fn select_device_payload(devices: &[Arc<dyn Device>], webusb: bool) -> Value {
    json!({
        "webusb": webusb,
        "devices": devices.iter().map(|d| d.to_message_object()).collect::<Vec<_>>(),
    })
}
