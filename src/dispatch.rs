// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Call dispatcher
//!
//! Drives one method call from payload to terminal response: resolve a
//! device, gate on permissions and firmware, open the session, execute the
//! method body, and release every resource on every exit path. Exactly one
//! response message is emitted per call id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    bridge,
    core::{CallEntry, CoreInner},
    device::{Device, FirmwareStatus, RunOptions},
    error::{
        CoreError, ErrorCode, INVALID_PIN_ERROR_MESSAGE, WRONG_PREVIOUS_SESSION_ERROR_MESSAGE,
    },
    message::{CoreMessage, EventTag},
    method::{Method, MethodContext, Permission},
};

/// PIN entry attempts per call, counting the first one
const MAX_PIN_TRIES: u32 = 3;

impl CoreInner {
    /// Run one call to completion. Never returns an error, the outcome is
    /// always delivered as a response message.
    pub(crate) async fn dispatch_call(self: Arc<Self>, id: u32, mut payload: Value) {
        debug!("dispatching call {id}");

        // sticky device hint from an earlier "remember" choice
        let preferred = self.state().preferred_device.clone();
        if let Some(path) = preferred {
            if let Value::Object(map) = &mut payload {
                if !map.contains_key("device") {
                    map.insert("device".into(), json!({ "path": path }));
                }
            }
        }

        let method = match self.methods.create(id, &payload) {
            Ok(method) => method,
            Err(e) => {
                warn!("call {id} rejected: {e}");
                self.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
                self.emit(CoreMessage::response_err(id, &e));
                return;
            }
        };

        self.state().calls.push(CallEntry {
            id,
            device_path: method.info().device_path.clone(),
            method: method.clone(),
        });
        let ctx = MethodContext {
            core: Arc::downgrade(&self),
        };

        // no device involved: a popup round-trip at most, then run
        if !method.info().use_device {
            let result = self.run_without_device(&ctx, &method).await;
            let response = match result {
                Ok(payload) => CoreMessage::response_ok(id, payload),
                Err(e) => CoreMessage::response_err(id, &e),
            };
            self.timeout.stop();
            method.dispose();
            self.emit(response);
            return;
        }

        // late transport bootstrap when reconnect is not managing it
        if self.device_list().is_none() && !self.settings.transport_reconnect {
            if let Err(e) = self.init_device_list().await {
                warn!("transport bootstrap failed: {e}");
            }
        }

        // management methods need a trusted context when popup-driven
        if self.settings.popup
            && !self.settings.trusted_host
            && method
                .info()
                .required_permissions
                .contains(&Permission::Management)
        {
            self.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
            self.fail_call(id, &method, CoreError::code(ErrorCode::MethodNotAllowed));
            return;
        }

        let device = match self.select_device(&method).await {
            Ok(device) => device,
            Err(e) => {
                if e.code == ErrorCode::TransportMissing {
                    let _ = self.popup_promise(true).wait().await;
                    let info = self
                        .device_list()
                        .map(|l| l.transport_info())
                        .unwrap_or_default();
                    self.emit(CoreMessage::ui(EventTag::UiTransport, Some(json!(info))));
                } else {
                    self.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
                }
                self.fail_call(id, &method, e);
                return;
            }
        };
        debug!("call {id} resolved device {}", device.path());

        // the registry tracks the resolved path for override bookkeeping
        {
            let mut state = self.state();
            if let Some(entry) = state.calls.iter_mut().find(|c| c.id == id) {
                entry.device_path = Some(device.path().to_string());
            }
        }

        // debug link runs bypass permission and firmware logic entirely
        if method.info().debug_link {
            let response = match method.run(&ctx, Some(device.clone())).await {
                Ok(payload) => CoreMessage::response_ok(id, payload),
                Err(e) => CoreMessage::response_err(id, &e),
            };
            self.timeout.stop();
            method.dispose();
            self.emit(response);
            return;
        }

        // preempt earlier calls holding this device, or respect them
        let previous: Vec<Arc<dyn Method>> = {
            let state = self.state();
            state
                .calls
                .iter()
                .filter(|c| {
                    c.id != id
                        && c.device_path.as_deref() == Some(device.path())
                        && !c.method.overridden()
                })
                .map(|c| c.method.clone())
                .collect()
        };
        if method.info().override_previous_call && !previous.is_empty() {
            debug!("call {id} overrides {} previous call(s)", previous.len());
            for m in &previous {
                m.set_overridden(true);
            }
            device
                .call_override(CoreError::code(ErrorCode::MethodOverride))
                .await;
            // we may have been overridden ourselves while waiting
            if method.overridden() {
                self.fail_call(id, &method, CoreError::code(ErrorCode::MethodOverride));
                return;
            }
        } else if device.is_running() {
            if !device.is_loaded() {
                device.wait_for_first_run().await;
            } else {
                self.fail_call(
                    id,
                    &method,
                    CoreError::code(ErrorCode::DeviceCallInProgress),
                );
                return;
            }
        }

        device.set_instance(method.info().device_instance);
        if method.info().has_expected_device_state {
            device.set_external_state(method.info().device_state.clone());
        }

        // interaction events flow through the bridge for the whole session
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        device.attach_listener(events_tx);
        let bridge_task = tokio::spawn(bridge::run_bridge(
            Arc::downgrade(&self),
            device.clone(),
            method.clone(),
            events_rx,
        ));

        // protocol definitions for the connected firmware
        let prepared = match self.device_list() {
            Some(list) => list.load_protocol(&device.version()).await,
            None => Ok(()),
        };

        let response_slot: Arc<Mutex<Option<CoreMessage>>> = Arc::new(Mutex::new(None));
        let run_result = match prepared {
            Ok(()) => {
                let options = RunOptions {
                    keep_session: method.info().keep_session,
                    use_empty_passphrase: method.info().use_empty_passphrase,
                    skip_final_reload: method.info().skip_final_reload,
                };
                let body = Box::pin(run_call(
                    self.clone(),
                    ctx.clone(),
                    method.clone(),
                    device.clone(),
                    response_slot.clone(),
                ));
                device.run(body, options).await
            }
            Err(e) => Err(e),
        };

        if let Err(error) = &run_result {
            debug!("call {id} session failed: {error}");
            // delay reconnects to a device that dropped off mid-auth
            if error.code == ErrorCode::DeviceDisconnected {
                if let Some(list) = self.device_list() {
                    list.add_auth_penalty(device.path());
                }
            }
            // a stale session id means the session table is out of date
            if error.message == WRONG_PREVIOUS_SESSION_ERROR_MESSAGE {
                if let Some(list) = self.device_list() {
                    list.enumerate().await;
                }
            }
        }

        let response = match run_result {
            Ok(()) => self
                .take_response(&response_slot)
                .unwrap_or_else(|| CoreMessage::response_ok(id, Value::Null)),
            Err(e) => CoreMessage::response_err(id, &e),
        };

        self.close_call(&method, &device, bridge_task, response).await;
    }

    async fn run_without_device(
        &self,
        ctx: &MethodContext,
        method: &Arc<dyn Method>,
    ) -> Result<Value, CoreError> {
        if method.info().use_ui {
            self.popup_promise(true).wait().await?;
        } else {
            self.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
        }
        method.run(ctx, None).await
    }

    fn take_response(&self, slot: &Arc<Mutex<Option<CoreMessage>>>) -> Option<CoreMessage> {
        slot.lock().expect("response slot poisoned").take()
    }

    /// Fail a call that never opened a device session
    fn fail_call(&self, id: u32, method: &Arc<dyn Method>, error: CoreError) {
        debug!("call {id} failed: {error}");
        self.timeout.stop();
        method.dispose();
        self.emit(CoreMessage::response_err(id, &error));
    }

    /// Tear down after a device session, then deliver the response.
    ///
    /// Runs on every exit path of the session, success or failure.
    async fn close_call(
        &self,
        method: &Arc<dyn Method>,
        device: &Arc<dyn Device>,
        bridge_task: JoinHandle<()>,
        response: CoreMessage,
    ) {
        let success = response.success == Some(true);

        // give the firmware time to reboot, then refresh features
        if method.info().name == "rebootToBootloader" && success {
            tokio::time::sleep(Duration::from_millis(501)).await;
            let options = RunOptions {
                skip_final_reload: true,
                ..Default::default()
            };
            let _ = device
                .run(Box::pin(async { Ok::<(), CoreError>(()) }), options)
                .await;
        }

        device.cleanup().await;
        bridge_task.abort();

        self.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
        self.emit(CoreMessage::ui(EventTag::UiCloseUiWindow, None));

        let (promises, popup) = {
            let mut state = self.state();
            (
                state.ui_promises.drain(..).collect::<Vec<_>>(),
                state.popup.take(),
            )
        };
        for promise in promises {
            promise.reject(CoreError::interrupted());
        }
        if let Some(popup) = popup {
            popup.reject(CoreError::interrupted());
        }

        self.timeout.stop();
        method.dispose();

        if success {
            if let Some(list) = self.device_list() {
                list.remove_auth_penalty(device.path());
                let _ = list.restore_default_messages().await;
            }
        }

        self.emit(response);
    }
}

enum Recovery {
    Done,
    Restart,
}

/// Session body: the gated, retryable path to the method's `run`
async fn run_call(
    core: Arc<CoreInner>,
    ctx: MethodContext,
    method: Arc<dyn Method>,
    device: Arc<dyn Device>,
    response: Arc<Mutex<Option<CoreMessage>>>,
) -> Result<(), CoreError> {
    let mut pin_tries = 1;

    loop {
        // firmware must be inside the method's supported range
        if let Some(exception) = method.check_firmware_range(core.settings.popup) {
            return fail_interactive(
                &core,
                &device,
                exception.ui_tag(),
                CoreError::new(ErrorCode::DeviceFwException, exception.to_string()),
            )
            .await;
        }

        // device mode must satisfy the method's allow/require sets
        if let Some(exception) = device.has_unexpected_mode(
            &method.info().allow_device_mode,
            &method.info().require_device_mode,
        ) {
            device.set_keep_session(false);
            return fail_interactive(
                &core,
                &device,
                exception.ui_tag(),
                CoreError::new(ErrorCode::DeviceModeException, exception.to_string()),
            )
            .await;
        }

        // permissions from an untrusted host need an explicit grant
        method.check_permissions();
        if !core.settings.trusted_host && !method.info().required_permissions.is_empty() {
            if !method.request_permissions(&ctx).await? {
                return Err(CoreError::code(ErrorCode::MethodPermissionsNotGranted));
            }
        }

        // remind the user when the seed has no backup
        if device.features().needs_backup {
            if method.has_no_backup_confirmation() && !method.no_backup_confirmation(&ctx).await? {
                return Err(CoreError::code(ErrorCode::MethodPermissionsNotGranted));
            }
            core.popup_promise(true).wait().await?;
            core.emit(CoreMessage::ui(
                EventTag::UiDeviceNeedsBackup,
                Some(device.to_message_object()),
            ));
        }

        if device.firmware_status() == FirmwareStatus::Outdated {
            core.popup_promise(true).wait().await?;
            core.emit(CoreMessage::ui(
                EventTag::UiFirmwareOutdated,
                Some(device.to_message_object()),
            ));
        }

        if !core.settings.trusted_host
            && method.has_confirmation()
            && !method.confirmation(&ctx).await?
        {
            return Err(CoreError::code(ErrorCode::MethodCancel));
        }

        // reload protocol definitions, the firmware may have re-initialized
        if let Some(list) = core.device_list() {
            list.load_protocol(&device.version()).await?;
        }

        if method.info().use_device_state {
            match validate_session_state(&core, &method, &device).await {
                Ok(Recovery::Restart) => continue,
                Ok(Recovery::Done) => {}
                Err(e) if e.message == INVALID_PIN_ERROR_MESSAGE && pin_tries < MAX_PIN_TRIES => {
                    pin_tries += 1;
                    debug!("invalid pin, attempt {pin_tries}/{MAX_PIN_TRIES}");
                    core.emit(CoreMessage::ui(
                        EventTag::UiInvalidPin,
                        Some(device.to_message_object()),
                    ));
                    continue;
                }
                Err(e) => {
                    device.set_internal_state(None);
                    return Err(e);
                }
            }
        }

        if method.info().use_ui {
            core.popup_promise(true).wait().await?;
        } else {
            core.emit(CoreMessage::ui(EventTag::PopupCancelPopupRequest, None));
        }

        if let Some(messages) = method.custom_messages() {
            if let Some(list) = core.device_list() {
                list.load_custom_messages(messages, true).await?;
            }
        }

        let payload = method.run(&ctx, Some(device.clone())).await?;
        *response.lock().expect("response slot poisoned") =
            Some(CoreMessage::response_ok(method.info().response_id, payload));
        return Ok(());
    }
}

/// Popup mode shows the blocking screen and waits for the user to unplug;
/// headless mode fails directly.
async fn fail_interactive(
    core: &Arc<CoreInner>,
    device: &Arc<dyn Device>,
    tag: EventTag,
    direct: CoreError,
) -> Result<(), CoreError> {
    if !core.settings.popup {
        return Err(direct);
    }

    core.popup_promise(true).wait().await?;
    core.emit(CoreMessage::ui(tag, Some(device.to_message_object())));

    let promise = core.create_ui_promise(EventTag::DeviceDisconnect, Some(device));
    let result = promise.wait().await;
    core.remove_ui_promise(&promise);
    result?;

    Err(CoreError::code(ErrorCode::MethodCancel))
}

/// Check cached session state, walking the user through recovery when it
/// does not match.
async fn validate_session_state(
    core: &Arc<CoreInner>,
    method: &Arc<dyn Method>,
    device: &Arc<dyn Device>,
) -> Result<Recovery, CoreError> {
    let state = device.validate_state(method.info().network.as_ref()).await?;
    let Some(state) = state.filter(|s| !s.is_empty()) else {
        return Ok(Recovery::Done);
    };

    if !core.settings.popup {
        return Err(CoreError::code(ErrorCode::DeviceInvalidState));
    }

    debug!("session state mismatch on {}", device.path());
    let promise = core.create_ui_promise(EventTag::UiInvalidPassphraseAction, Some(device));
    core.emit(CoreMessage::ui(
        EventTag::UiInvalidPassphrase,
        Some(json!({ "device": device.to_message_object() })),
    ));
    let result = promise.wait().await;
    core.remove_ui_promise(&promise);
    let result = result?;

    if result.event == EventTag::DeviceDisconnect {
        return Err(CoreError::code(ErrorCode::DeviceDisconnected));
    }

    match result.payload.as_str() {
        Some("retry") => {
            // start over with a clean device state
            device.set_internal_state(None);
            device.initialize(method.info().use_empty_passphrase).await?;
            Ok(Recovery::Restart)
        }
        _ => {
            device.set_external_state(Some(state));
            Ok(Recovery::Done)
        }
    }
}
