// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Shared test fixtures: in-memory device, device list, transport, and a
//! scripted popup that answers UI requests the way a real surface would.

#![allow(dead_code)]

use std::{
    collections::HashSet,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, LevelFilter};
use serde_json::{json, Value};
use simplelog::SimpleLogger;
use tokio::sync::{mpsc, oneshot, Notify};

use wallet_bridge::{
    core::Core,
    device::{
        Device, DeviceEvent, DeviceFeatures, DeviceList, DeviceListEvent, DeviceMode,
        DeviceVersion, FirmwareStatus, ModeException, PassphrasePayload, RunOptions, SessionBody,
        Transport, TransportInfo, TransportKind, TransportOptions,
    },
    error::{CoreError, ErrorCode, INVALID_PIN_ERROR_MESSAGE},
    message::{CoreMessage, EventTag},
    method::{Method, MethodContext, MethodCore, MethodInfo, MethodRegistry},
    settings::Settings,
};

/// Setup logging from the LOG_LEVEL environment variable
pub fn init_logging() {
    let log_level = match std::env::var("LOG_LEVEL").map(|v| LevelFilter::from_str(&v)) {
        Ok(Ok(l)) => l,
        _ => LevelFilter::Debug,
    };
    let _ = SimpleLogger::init(log_level, simplelog::Config::default());
}

/// In-memory device with scriptable interaction behavior
pub struct MockDevice {
    path: String,
    pub features: Mutex<DeviceFeatures>,
    pub firmware_status: Mutex<FirmwareStatus>,
    pub version: DeviceVersion,
    pub unreadable: AtomicBool,
    running: AtomicBool,
    loaded: AtomicBool,
    used_here: AtomicBool,
    pub keep_session: AtomicBool,
    pub instance: AtomicU32,
    pub external_state: Mutex<Option<String>>,
    pub internal_state: Mutex<Option<String>>,
    listener: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
    interruption: Mutex<Option<CoreError>>,
    interrupt_notify: Notify,
    session: tokio::sync::Mutex<()>,

    // scripted behavior
    /// Ask for a PIN during state validation
    pub require_pin: AtomicBool,
    /// How many PIN entries fail before one is accepted
    pub wrong_pins: AtomicU32,
    /// State returned by the next validation mismatch
    pub state_mismatch: Mutex<Option<String>>,
    /// Mode violation reported to the dispatcher
    pub mode_exception: Mutex<Option<ModeException>>,

    // observability
    pub cleanup_calls: AtomicU32,
    pub initialize_calls: AtomicU32,
    pub run_calls: AtomicU32,
}

impl MockDevice {
    pub fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            features: Mutex::new(DeviceFeatures {
                vendor: "mock".into(),
                label: format!("Mock {path}"),
                initialized: true,
                needs_backup: false,
            }),
            firmware_status: Mutex::new(FirmwareStatus::Valid),
            version: DeviceVersion {
                major: 2,
                minor: 6,
                patch: 0,
            },
            unreadable: AtomicBool::new(false),
            running: AtomicBool::new(false),
            loaded: AtomicBool::new(true),
            used_here: AtomicBool::new(false),
            keep_session: AtomicBool::new(false),
            instance: AtomicU32::new(0),
            external_state: Mutex::new(None),
            internal_state: Mutex::new(None),
            listener: Mutex::new(None),
            interruption: Mutex::new(None),
            interrupt_notify: Notify::new(),
            session: tokio::sync::Mutex::new(()),
            require_pin: AtomicBool::new(false),
            wrong_pins: AtomicU32::new(0),
            state_mismatch: Mutex::new(None),
            mode_exception: Mutex::new(None),
            cleanup_calls: AtomicU32::new(0),
            initialize_calls: AtomicU32::new(0),
            run_calls: AtomicU32::new(0),
        })
    }

    fn listener(&self) -> Option<mpsc::UnboundedSender<DeviceEvent>> {
        self.listener.lock().unwrap().clone()
    }

    fn interrupt(&self, error: CoreError) {
        *self.interruption.lock().unwrap() = Some(error);
        self.interrupt_notify.notify_waiters();
    }

    async fn interrupted(&self) -> CoreError {
        loop {
            let notified = self.interrupt_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(e) = self.interruption.lock().unwrap().take() {
                return e;
            }
            notified.await;
        }
    }

    /// Raise a PIN request against the attached session listener
    pub async fn request_pin(&self) -> Result<String, CoreError> {
        let listener = self
            .listener()
            .ok_or_else(|| CoreError::new(ErrorCode::DeviceDisconnected, "no listener"))?;
        let (tx, rx) = oneshot::channel();
        listener
            .send(DeviceEvent::PinRequest { respond: tx })
            .map_err(|_| CoreError::interrupted())?;
        rx.await.map_err(|_| CoreError::interrupted())?
    }

    /// Raise a passphrase request against the attached session listener
    pub async fn request_passphrase(&self) -> Result<PassphrasePayload, CoreError> {
        let listener = self
            .listener()
            .ok_or_else(|| CoreError::new(ErrorCode::DeviceDisconnected, "no listener"))?;
        let (tx, rx) = oneshot::channel();
        listener
            .send(DeviceEvent::PassphraseRequest { respond: tx })
            .map_err(|_| CoreError::interrupted())?;
        rx.await.map_err(|_| CoreError::interrupted())?
    }

    /// Raise a button prompt, no reply expected
    pub fn request_button(&self, code: &str) {
        if let Some(listener) = self.listener() {
            let _ = listener.send(DeviceEvent::Button {
                code: code.to_string(),
            });
        }
    }
}

#[async_trait]
impl Device for MockDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn is_used_here(&self) -> bool {
        self.used_here.load(Ordering::SeqCst)
    }

    fn is_unreadable(&self) -> bool {
        self.unreadable.load(Ordering::SeqCst)
    }

    fn features(&self) -> DeviceFeatures {
        self.features.lock().unwrap().clone()
    }

    fn firmware_status(&self) -> FirmwareStatus {
        *self.firmware_status.lock().unwrap()
    }

    fn version(&self) -> DeviceVersion {
        self.version
    }

    fn set_keep_session(&self, keep: bool) {
        self.keep_session.store(keep, Ordering::SeqCst);
    }

    fn set_instance(&self, instance: u32) {
        self.instance.store(instance, Ordering::SeqCst);
    }

    fn set_external_state(&self, state: Option<String>) {
        *self.external_state.lock().unwrap() = state;
    }

    fn set_internal_state(&self, state: Option<String>) {
        *self.internal_state.lock().unwrap() = state;
    }

    fn has_unexpected_mode(
        &self,
        _allow: &[DeviceMode],
        _require: &[DeviceMode],
    ) -> Option<ModeException> {
        *self.mode_exception.lock().unwrap()
    }

    async fn wait_for_first_run(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    async fn validate_state(&self, _network: Option<&Value>) -> Result<Option<String>, CoreError> {
        if self.require_pin.load(Ordering::SeqCst) {
            let pin = self.request_pin().await?;
            debug!("mock device received pin: {pin}");
            if self.wrong_pins.load(Ordering::SeqCst) > 0 {
                self.wrong_pins.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::new(
                    ErrorCode::DeviceInvalidState,
                    INVALID_PIN_ERROR_MESSAGE,
                ));
            }
        }
        Ok(self.state_mismatch.lock().unwrap().take())
    }

    async fn initialize(&self, _use_empty_passphrase: bool) -> Result<(), CoreError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn call_override(&self, error: CoreError) {
        self.interrupt(error);
        tokio::task::yield_now().await;
    }

    async fn run(&self, body: SessionBody, _options: RunOptions) -> Result<(), CoreError> {
        let _session = self.session.lock().await;
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        *self.interruption.lock().unwrap() = None;
        self.running.store(true, Ordering::SeqCst);
        self.used_here.store(true, Ordering::SeqCst);

        let result = tokio::select! {
            r = body => r,
            e = self.interrupted() => Err(e),
        };

        self.running.store(false, Ordering::SeqCst);
        self.used_here.store(false, Ordering::SeqCst);
        result
    }

    async fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock().unwrap() = None;
    }

    fn attach_listener(&self, listener: mpsc::UnboundedSender<DeviceEvent>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn interruption_from_user(&self, error: CoreError) {
        self.interrupt(error);
    }

    fn to_message_object(&self) -> Value {
        json!({
            "path": self.path,
            "label": self.features.lock().unwrap().label,
        })
    }
}

/// In-memory device list
pub struct MockDeviceList {
    kind: TransportKind,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DeviceListEvent>>>,
    pub penalties: Mutex<HashSet<String>>,
    pub enumerations: AtomicU32,
    pub protocol_loads: AtomicU32,
    pub custom_message_loads: AtomicU32,
    pub default_message_restores: AtomicU32,
    pub disposed: AtomicBool,
}

impl MockDeviceList {
    pub fn new(kind: TransportKind, devices: Vec<Arc<MockDevice>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            devices: Mutex::new(devices),
            subscribers: Mutex::new(Vec::new()),
            penalties: Mutex::new(HashSet::new()),
            enumerations: AtomicU32::new(0),
            protocol_loads: AtomicU32::new(0),
            custom_message_loads: AtomicU32::new(0),
            default_message_restores: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: DeviceListEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Plug a device in and notify subscribers
    pub fn connect(&self, device: Arc<MockDevice>) {
        self.devices.lock().unwrap().push(device.clone());
        self.emit(DeviceListEvent::Connect(device));
    }

    /// Unplug a device and notify subscribers
    pub fn disconnect(&self, path: &str) {
        let device = {
            let mut devices = self.devices.lock().unwrap();
            let found = devices.iter().position(|d| d.path() == path);
            found.map(|i| devices.remove(i))
        };
        if let Some(device) = device {
            self.emit(DeviceListEvent::Disconnect(device));
        }
    }
}

#[async_trait]
impl DeviceList for MockDeviceList {
    fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.clone() as Arc<dyn Device>)
            .collect()
    }

    fn get(&self, path: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.path() == path)
            .map(|d| d.clone() as Arc<dyn Device>)
    }

    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            kind: self.kind.to_string(),
            version: "2.0.0".into(),
            outdated: false,
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceListEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    async fn load_protocol(&self, _version: &DeviceVersion) -> Result<(), CoreError> {
        self.protocol_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_custom_messages(&self, _messages: Value, _force: bool) -> Result<(), CoreError> {
        self.custom_message_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_default_messages(&self) -> Result<(), CoreError> {
        self.default_message_restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enumerate(&self) {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
    }

    fn add_auth_penalty(&self, path: &str) {
        self.penalties.lock().unwrap().insert(path.to_string());
    }

    fn remove_auth_penalty(&self, path: &str) {
        self.penalties.lock().unwrap().remove(path);
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
    }
}

/// Transport factory handing out a prepared list
pub struct MockTransport {
    pub list: Mutex<Option<Arc<MockDeviceList>>>,
    pub opens: AtomicU32,
    pub fail_opens: AtomicU32,
    pub last_options: Mutex<Option<TransportOptions>>,
}

impl MockTransport {
    pub fn new(list: Arc<MockDeviceList>) -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(Some(list)),
            opens: AtomicU32::new(0),
            fail_opens: AtomicU32::new(0),
            last_options: Mutex::new(None),
        })
    }

    /// A transport that never comes up
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(None),
            opens: AtomicU32::new(0),
            fail_opens: AtomicU32::new(u32::MAX),
            last_options: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, options: &TransportOptions) -> Result<Arc<dyn DeviceList>, CoreError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        if self.fail_opens.load(Ordering::SeqCst) > 0 {
            self.fail_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::code(ErrorCode::TransportMissing));
        }
        self.list
            .lock()
            .unwrap()
            .clone()
            .map(|l| l as Arc<dyn DeviceList>)
            .ok_or_else(|| CoreError::code(ErrorCode::TransportMissing))
    }
}

/// What a mock method does when it finally runs
pub enum Behavior {
    /// Return the payload, annotated with the device path when one is set
    Ok(Value),
    Fail(CoreError),
    /// Never return, the call must be preempted or interrupted
    Block,
    /// Ask the device for a passphrase and echo it back
    Passphrase(Arc<MockDevice>),
    /// Raise a button prompt, then return
    Button(Arc<MockDevice>, &'static str),
}

/// Scriptable method
pub struct MockMethod {
    core: MethodCore,
    behavior: Behavior,
    pub runs: AtomicU32,
    pub disposed: AtomicBool,
}

impl MockMethod {
    pub fn new(info: MethodInfo, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            core: MethodCore::new(info),
            behavior,
            runs: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Method for MockMethod {
    fn info(&self) -> &MethodInfo {
        self.core.info()
    }

    fn overridden(&self) -> bool {
        self.core.overridden()
    }

    fn set_overridden(&self, overridden: bool) {
        self.core.set_overridden(overridden);
    }

    async fn run(
        &self,
        _ctx: &MethodContext,
        device: Option<Arc<dyn Device>>,
    ) -> Result<Value, CoreError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Ok(value) => {
                let mut value = value.clone();
                if let (Value::Object(map), Some(device)) = (&mut value, &device) {
                    map.insert("device".into(), json!(device.path()));
                }
                Ok(value)
            }
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Block => {
                futures::future::pending::<()>().await;
                Err(CoreError::interrupted())
            }
            Behavior::Passphrase(device) => {
                let payload = device.request_passphrase().await?;
                Ok(json!({ "passphrase": payload.passphrase }))
            }
            Behavior::Button(device, code) => {
                device.request_button(code);
                // leave the bridge time to surface the prompt
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({ "confirmed": true }))
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Register a mock method, capturing every created instance
pub fn register_mock(
    registry: &mut MethodRegistry,
    name: &'static str,
    adjust: impl Fn(&mut MethodInfo) + Send + Sync + 'static,
    behavior: impl Fn() -> Behavior + Send + Sync + 'static,
) -> Arc<Mutex<Vec<Arc<MockMethod>>>> {
    let created: Arc<Mutex<Vec<Arc<MockMethod>>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = created.clone();
    registry.register(name, move |id, payload| {
        let mut info = MethodInfo::from_payload(name, id, payload);
        adjust(&mut info);
        let method = MockMethod::new(info, behavior());
        captured.lock().unwrap().push(method.clone());
        Ok(method as Arc<dyn Method>)
    });
    created
}

/// Scripted popup surface: answers UI requests like a user would
#[derive(Clone)]
pub struct Autopilot {
    /// Answer popup window requests with a handshake
    pub handshake: bool,
    pub pin: String,
    pub word: String,
    pub passphrase: String,
    /// Device path chosen in the picker
    pub select_path: Option<String>,
    pub remember: bool,
    /// Reply to a session-state mismatch ("retry" or "accept")
    pub invalid_state_action: String,
}

impl Default for Autopilot {
    fn default() -> Self {
        Self {
            handshake: true,
            pin: "1234".into(),
            word: "zoo".into(),
            passphrase: String::new(),
            select_path: None,
            remember: false,
            invalid_state_action: "accept".into(),
        }
    }
}

impl Autopilot {
    pub fn spawn(self, core: Arc<Core>) -> tokio::task::JoinHandle<()> {
        let mut rx = core.subscribe();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let reply = match message.message_type {
                    EventTag::UiRequestUiWindow if self.handshake => Some(CoreMessage {
                        event: wallet_bridge::message::MessageEvent::Core,
                        message_type: EventTag::PopupHandshake,
                        id: None,
                        payload: None,
                        success: None,
                    }),
                    EventTag::UiRequestPin => Some(ui_response(
                        EventTag::UiReceivePin,
                        Value::String(self.pin.clone()),
                    )),
                    EventTag::UiRequestWord => Some(ui_response(
                        EventTag::UiReceiveWord,
                        Value::String(self.word.clone()),
                    )),
                    EventTag::UiRequestPassphrase => Some(ui_response(
                        EventTag::UiReceivePassphrase,
                        json!({ "value": self.passphrase }),
                    )),
                    EventTag::UiInvalidPassphrase => Some(ui_response(
                        EventTag::UiInvalidPassphraseAction,
                        Value::String(self.invalid_state_action.clone()),
                    )),
                    EventTag::UiSelectDevice => self.select_path.as_ref().map(|path| {
                        ui_response(
                            EventTag::UiReceiveDevice,
                            json!({
                                "remember": self.remember,
                                "device": { "path": path },
                            }),
                        )
                    }),
                    _ => None,
                };
                if let Some(reply) = reply {
                    core.handle_message(reply, true).await;
                }
            }
        })
    }
}

/// Inbound UI response envelope
pub fn ui_response(tag: EventTag, payload: Value) -> CoreMessage {
    CoreMessage {
        event: wallet_bridge::message::MessageEvent::Ui,
        message_type: tag,
        id: None,
        payload: Some(payload),
        success: None,
    }
}

/// Inbound popup handshake
pub fn handshake_msg() -> CoreMessage {
    CoreMessage {
        event: wallet_bridge::message::MessageEvent::Core,
        message_type: EventTag::PopupHandshake,
        id: None,
        payload: None,
        success: None,
    }
}

/// Inbound popup-closed notification
pub fn popup_closed_msg() -> CoreMessage {
    CoreMessage {
        event: wallet_bridge::message::MessageEvent::Core,
        message_type: EventTag::PopupClosed,
        id: None,
        payload: None,
        success: None,
    }
}

/// Next outbound message, failing the test after five seconds
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<CoreMessage>) -> CoreMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("emitter closed")
}

/// Collect outbound messages until the response for `id` arrives
pub async fn collect_until_response(
    rx: &mut mpsc::UnboundedReceiver<CoreMessage>,
    id: u32,
) -> (Vec<CoreMessage>, CoreMessage) {
    let mut seen = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for response")
            .expect("emitter closed");
        if message.is_response() && message.id == Some(id) {
            return (seen, message);
        }
        seen.push(message);
    }
}

/// Poll until `check` holds
pub async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Tags of the given messages, for subsequence assertions
pub fn tags(messages: &[CoreMessage]) -> Vec<EventTag> {
    messages.iter().map(|m| m.message_type).collect()
}

/// Assert `expected` appears as an ordered subsequence
pub fn assert_subsequence(actual: &[EventTag], expected: &[EventTag]) {
    let mut it = actual.iter();
    for tag in expected {
        assert!(
            it.any(|t| t == tag),
            "missing {tag:?} (in order) within {actual:?}"
        );
    }
}

/// Wire a core to a mock list and transport with the default single setup
pub fn setup_core(
    settings: Settings,
    registry: MethodRegistry,
    list: Arc<MockDeviceList>,
) -> (Arc<Core>, Arc<MockTransport>) {
    init_logging();
    let transport = MockTransport::new(list);
    let core = Arc::new(Core::init(
        settings,
        Box::new(SharedTransport(transport.clone())),
        registry,
    ));
    (core, transport)
}

/// Adapter so tests can keep a handle on the transport they hand over
pub struct SharedTransport(pub Arc<MockTransport>);

#[async_trait]
impl Transport for SharedTransport {
    async fn open(&self, options: &TransportOptions) -> Result<Arc<dyn DeviceList>, CoreError> {
        self.0.open(options).await
    }
}
