// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Core controller
//!
//! Owns the device list, the popup readiness slot, the pending UI
//! round-trips, the call registry, and the interaction timeout. Inbound
//! messages enter through [Core::handle_message]; outbound messages leave
//! through the single emitter, and emitting a response retires its call
//! registry entry.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    deferred::{Deferred, UiPromise, UiResponse},
    device::{Device, DeviceList, DeviceListEvent, Transport, TransportInfo, TransportKind, TransportOptions},
    emitter::Emitter,
    error::CoreError,
    message::{CoreMessage, EventTag},
    method::{Method, MethodRegistry},
    settings::Settings,
    timeout::InteractionTimeout,
};

/// An in-flight call
pub(crate) struct CallEntry {
    pub id: u32,
    pub device_path: Option<String>,
    pub method: Arc<dyn Method>,
}

/// Snapshot entry of the call registry
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CallInfo {
    pub id: u32,
    pub name: String,
}

/// Mutable core state behind one lock
pub(crate) struct CoreState {
    pub ui_promises: Vec<Arc<UiPromise>>,
    pub popup: Option<Arc<Deferred<()>>>,
    pub calls: Vec<CallEntry>,
    pub preferred_device: Option<String>,
}

struct DeviceListHandle {
    list: Arc<dyn DeviceList>,
    events_task: JoinHandle<()>,
}

pub(crate) struct CoreInner {
    pub(crate) settings: Settings,
    pub(crate) emitter: Emitter,
    pub(crate) methods: MethodRegistry,
    pub(crate) timeout: InteractionTimeout,
    transport: Box<dyn Transport>,
    state: Mutex<CoreState>,
    list: Mutex<Option<DeviceListHandle>>,
    webusb: AtomicBool,
    disposed: AtomicBool,
    /// Back-reference handed to spawned tasks and timer closures
    weak: Weak<CoreInner>,
}

impl CoreInner {
    pub(crate) fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("core state poisoned")
    }

    pub(crate) fn disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn device_list(&self) -> Option<Arc<dyn DeviceList>> {
        self.list
            .lock()
            .expect("device list poisoned")
            .as_ref()
            .map(|h| h.list.clone())
    }

    /// Emit an outbound message. A response retires its call entry first.
    pub(crate) fn emit(&self, message: CoreMessage) {
        if message.is_response() {
            if let Some(id) = message.id {
                self.state().calls.retain(|c| c.id != id);
            }
        }
        self.emitter.emit(message);
    }

    /// Popup readiness slot without requesting a window
    pub(crate) fn popup_slot(&self) -> Arc<Deferred<()>> {
        self.state()
            .popup
            .get_or_insert_with(|| Arc::new(Deferred::new()))
            .clone()
    }

    /// Popup readiness slot, requesting a UI window if none is pending.
    ///
    /// Opening when already open returns the existing slot.
    pub(crate) fn popup_promise(&self, request_window: bool) -> Arc<Deferred<()>> {
        let (slot, created) = {
            let mut state = self.state();
            match &state.popup {
                Some(p) => (p.clone(), false),
                None => {
                    let d = Arc::new(Deferred::new());
                    state.popup = Some(d.clone());
                    (d, true)
                }
            }
        };
        if created && request_window {
            self.emit(CoreMessage::ui(EventTag::UiRequestUiWindow, None));
        }
        self.restart_interaction_timeout();
        slot
    }

    /// Register a pending UI round-trip, optionally bound to a device
    pub(crate) fn create_ui_promise(
        &self,
        tag: EventTag,
        device: Option<&Arc<dyn Device>>,
    ) -> Arc<UiPromise> {
        let promise = Arc::new(UiPromise::new(tag, device.map(|d| d.path().to_string())));
        self.state().ui_promises.push(promise.clone());
        self.restart_interaction_timeout();
        promise
    }

    /// First registered round-trip matching the tag, FIFO
    pub(crate) fn find_ui_promise(&self, tag: EventTag) -> Option<Arc<UiPromise>> {
        self.state()
            .ui_promises
            .iter()
            .find(|p| p.tag() == tag)
            .cloned()
    }

    pub(crate) fn remove_ui_promise(&self, promise: &Arc<UiPromise>) {
        self.state()
            .ui_promises
            .retain(|p| !Arc::ptr_eq(p, promise));
    }

    /// Settle the first round-trip matching the tag with an inbound payload
    pub(crate) fn resolve_ui_promise(&self, tag: EventTag, payload: Value) -> bool {
        match self.find_ui_promise(tag) {
            Some(promise) => {
                promise.resolve(UiResponse { event: tag, payload });
                self.remove_ui_promise(&promise);
                true
            }
            None => {
                debug!("no pending promise for {tag}");
                false
            }
        }
    }

    pub(crate) fn restart_interaction_timeout(&self) {
        let weak = self.weak.clone();
        self.timeout.start(move || {
            if let Some(core) = weak.upgrade() {
                debug!("interaction timeout fired");
                core.on_popup_closed(Some("Interaction timeout".into()));
            }
        });
    }

    /// Popup was closed by the user (or timed out).
    ///
    /// Devices with an open session here get a user interruption injected;
    /// otherwise every pending promise is rejected so waiting calls unwind
    /// through their own cleanup.
    pub(crate) fn on_popup_closed(&self, reason: Option<String>) {
        let error = match reason {
            Some(reason) => CoreError::cancelled(reason),
            None => CoreError::interrupted(),
        };
        debug!("popup closed: {error}");

        let used: Vec<_> = self
            .device_list()
            .map(|l| l.devices())
            .unwrap_or_default()
            .into_iter()
            .filter(|d| d.is_used_here())
            .collect();

        if used.is_empty() {
            let (promises, popup) = {
                let mut state = self.state();
                (
                    state.ui_promises.drain(..).collect::<Vec<_>>(),
                    state.popup.take(),
                )
            };
            for promise in promises {
                promise.reject(error.clone());
            }
            if let Some(popup) = popup {
                popup.reject(error);
            }
        } else {
            for device in used {
                device.interruption_from_user(error.clone());
            }
        }

        self.timeout.stop();
    }

    /// Route one inbound message
    pub(crate) async fn handle_message(&self, message: CoreMessage, trusted: bool) {
        if !trusted && !message.message_type.is_safe_for_untrusted() {
            // origin firewall: silently dropped
            return;
        }
        debug!("handle message {}", message.message_type);

        match message.message_type {
            EventTag::PopupHandshake => {
                self.popup_slot().resolve(());
            }
            EventTag::PopupClosed => {
                let reason = message
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.on_popup_closed(reason);
            }
            EventTag::TransportDisableWebusb => self.disable_webusb().await,
            EventTag::IframeCall => {
                let Some(id) = message.id else {
                    warn!("call without an id dropped");
                    return;
                };
                let payload = message.payload.unwrap_or(Value::Null);
                let Some(core) = self.weak.upgrade() else { return };
                tokio::spawn(async move {
                    core.dispatch_call(id, payload).await;
                });
            }
            tag if tag.is_ui_response() => {
                self.resolve_ui_promise(tag, message.payload.unwrap_or(Value::Null));
            }
            _ => {}
        }
    }

    /// Open the transport and start bridging device list events
    pub(crate) async fn init_device_list(&self) -> Result<(), CoreError> {
        let options = TransportOptions {
            webusb: self.webusb.load(Ordering::SeqCst),
            debug: self.settings.debug,
        };
        debug!("opening transport (webusb: {})", options.webusb);

        let list = self.transport.open(&options).await?;
        if self.disposed() {
            list.dispose().await;
            return Ok(());
        }

        let events = list.subscribe();
        let events_task = tokio::spawn(run_device_list_events(self.weak.clone(), events));
        *self.list.lock().expect("device list poisoned") = Some(DeviceListHandle {
            list,
            events_task,
        });
        Ok(())
    }

    /// Retry transport init until it succeeds (or once, without reconnect)
    pub(crate) fn spawn_transport_loop(&self, initial_delay: Option<Duration>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(delay) = initial_delay {
                tokio::time::sleep(delay).await;
            }
            loop {
                let Some(core) = weak.upgrade() else { return };
                if core.disposed() {
                    return;
                }
                match core.init_device_list().await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("transport init failed: {e}");
                        core.emit(CoreMessage::transport(
                            EventTag::TransportError,
                            json!({ "error": e.message }),
                        ));
                        if !core.settings.transport_reconnect {
                            return;
                        }
                    }
                }
                drop(core);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    /// Transport died under the device list
    pub(crate) async fn on_transport_error(&self, error: CoreError) {
        warn!("transport error: {error}");
        let handle = self.list.lock().expect("device list poisoned").take();
        if let Some(handle) = handle {
            // the events task ends by itself once the list is disposed
            handle.list.dispose().await;
        }
        self.emit(CoreMessage::transport(
            EventTag::TransportError,
            json!({ "error": error.message }),
        ));
        if self.settings.transport_reconnect && !self.disposed() {
            self.spawn_transport_loop(Some(Duration::from_secs(1)));
        }
    }

    /// Tear down a WebUSB device list and reopen without WebUSB
    async fn disable_webusb(&self) {
        let is_webusb = self
            .device_list()
            .map(|l| l.transport_kind() == TransportKind::WebUsb)
            .unwrap_or(false);
        if !is_webusb {
            return;
        }
        debug!("disabling webusb transport");
        self.webusb.store(false, Ordering::SeqCst);

        let handle = self.list.lock().expect("device list poisoned").take();
        if let Some(handle) = handle {
            handle.events_task.abort();
            handle.list.dispose().await;
        }

        if let Err(e) = self.init_device_list().await {
            warn!("transport reinit failed: {e}");
            self.emit(CoreMessage::transport(
                EventTag::TransportError,
                json!({ "error": e.message }),
            ));
            if self.settings.transport_reconnect {
                self.spawn_transport_loop(Some(Duration::from_secs(1)));
            }
        }
    }

    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing core");
        self.timeout.stop();

        let handle = self.list.lock().expect("device list poisoned").take();
        if let Some(handle) = handle {
            handle.events_task.abort();
            handle.list.dispose().await;
        }

        let (promises, popup, calls) = {
            let mut state = self.state();
            (
                state.ui_promises.drain(..).collect::<Vec<_>>(),
                state.popup.take(),
                state.calls.drain(..).collect::<Vec<_>>(),
            )
        };
        for promise in promises {
            promise.reject(CoreError::interrupted());
        }
        if let Some(popup) = popup {
            popup.reject(CoreError::interrupted());
        }
        for call in calls {
            call.method.dispose();
        }

        self.emitter.close();
    }
}

/// Forward device list events and feed live selection updates
async fn run_device_list_events(
    core: Weak<CoreInner>,
    mut events: mpsc::UnboundedReceiver<DeviceListEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else { return };
        debug!("device list event: {event:?}");
        match event {
            DeviceListEvent::Connect(device) => {
                core.emit(CoreMessage::device(
                    EventTag::DeviceConnect,
                    device.to_message_object(),
                ));
                core.on_device_selection_changed();
            }
            DeviceListEvent::ConnectUnacquired(device) => {
                core.emit(CoreMessage::device(
                    EventTag::DeviceConnectUnacquired,
                    device.to_message_object(),
                ));
                core.on_device_selection_changed();
            }
            DeviceListEvent::Disconnect(device) => {
                core.emit(CoreMessage::device(
                    EventTag::DeviceDisconnect,
                    device.to_message_object(),
                ));
                core.on_device_disconnect(&device);
            }
            DeviceListEvent::Changed => {
                let devices: Vec<_> = core
                    .device_list()
                    .map(|l| l.devices())
                    .unwrap_or_default()
                    .iter()
                    .map(|d| d.to_message_object())
                    .collect();
                core.emit(CoreMessage::device(EventTag::DeviceChanged, json!(devices)));
            }
            DeviceListEvent::TransportStart(info) => {
                core.emit(CoreMessage::transport(EventTag::TransportStart, info));
            }
            DeviceListEvent::TransportError(error) => {
                core.on_transport_error(error).await;
                return;
            }
        }
    }
}

/// The bridge core.
///
/// Construct with [Core::init], connect the transport with
/// [Core::init_transport], then feed messages through
/// [Core::handle_message] and consume outbound messages from
/// [Core::subscribe].
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Build a core from settings, a transport factory, and the method set
    pub fn init(settings: Settings, transport: Box<dyn Transport>, methods: MethodRegistry) -> Self {
        let timeout = InteractionTimeout::new(settings.effective_interaction_timeout());
        let webusb = settings.webusb;
        Self {
            inner: Arc::new_cyclic(|weak| CoreInner {
                settings,
                emitter: Emitter::new(),
                methods,
                timeout,
                transport,
                state: Mutex::new(CoreState {
                    ui_promises: Vec::new(),
                    popup: None,
                    calls: Vec::new(),
                    preferred_device: None,
                }),
                list: Mutex::new(None),
                webusb: AtomicBool::new(webusb),
                disposed: AtomicBool::new(false),
                weak: weak.clone(),
            }),
        }
    }

    /// Initialize the device list.
    ///
    /// With `transport_reconnect` the first init happens in the background
    /// and every failure is retried after a one second backoff, forever.
    pub async fn init_transport(&self) {
        if self.inner.settings.transport_reconnect {
            self.inner.spawn_transport_loop(None);
        } else if let Err(e) = self.inner.init_device_list().await {
            warn!("transport init failed: {e}");
            self.inner.emit(CoreMessage::transport(
                EventTag::TransportError,
                json!({ "error": e.message }),
            ));
        }
    }

    /// Register an outbound message subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreMessage> {
        self.inner.emitter.subscribe()
    }

    /// Route one inbound message; dispatch failures are logged, never thrown
    pub async fn handle_message(&self, message: CoreMessage, trusted: bool) {
        self.inner.handle_message(message, trusted).await;
    }

    /// Current transport descriptor, a placeholder when no transport is up
    pub fn transport_info(&self) -> TransportInfo {
        self.inner
            .device_list()
            .map(|l| l.transport_info())
            .unwrap_or_default()
    }

    /// Snapshot of in-flight calls
    pub fn current_calls(&self) -> Vec<CallInfo> {
        self.inner
            .state()
            .calls
            .iter()
            .map(|c| CallInfo {
                id: c.id,
                name: c.method.info().name.clone(),
            })
            .collect()
    }

    /// Release the transport, reject all pending work, drop subscribers
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
