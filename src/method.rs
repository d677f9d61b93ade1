// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Method capability surface
//!
//! Wallet operations (address derivation, signing, management) implement
//! [Method]; the core owns their lifecycle from lookup to `dispose`. A
//! method never touches core internals directly, UI round-trips go through
//! the [MethodContext] handed to its hooks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use strum::{Display, EnumString};

use crate::{
    core::CoreInner,
    deferred::UiPromise,
    device::{Device, DeviceMode, FirmwareException},
    error::{CoreError, ErrorCode},
    message::{CoreMessage, EventTag},
};

/// Permission tags a method may require from an untrusted host
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Management,
}

/// Static description of a method, parsed from the call payload
#[derive(Clone, Debug)]
pub struct MethodInfo {
    /// Method name from the call payload
    pub name: String,
    /// Request id the response must carry
    pub response_id: u32,
    /// Explicit device requested by the caller
    pub device_path: Option<String>,
    /// Passphrase instance, default 0
    pub device_instance: u32,
    /// Expected session state supplied by the caller
    pub device_state: Option<String>,
    /// The caller supplied an expected state
    pub has_expected_device_state: bool,
    /// Network descriptor for session-state validation
    pub network: Option<Value>,
    pub required_permissions: Vec<Permission>,
    pub allow_device_mode: Vec<DeviceMode>,
    pub require_device_mode: Vec<DeviceMode>,
    /// The method talks to a device at all
    pub use_device: bool,
    /// The method needs the popup UI surface
    pub use_ui: bool,
    pub use_empty_passphrase: bool,
    /// Validate cached session state before running
    pub use_device_state: bool,
    pub keep_session: bool,
    pub skip_final_reload: bool,
    /// Preempt an in-flight call on the same device
    pub override_previous_call: bool,
    /// Run against the debug link, skipping permission and firmware logic
    pub debug_link: bool,
}

impl MethodInfo {
    /// Parse the common envelope fields of a call payload
    pub fn from_payload(name: &str, response_id: u32, payload: &Value) -> Self {
        let device = payload.get("device");
        let device_path = device
            .and_then(|d| d.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let device_instance = device
            .and_then(|d| d.get("instance"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let device_state = device
            .and_then(|d| d.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let flag = |key: &str, default: bool| {
            payload.get(key).and_then(Value::as_bool).unwrap_or(default)
        };

        Self {
            name: name.to_string(),
            response_id,
            device_path,
            device_instance,
            has_expected_device_state: device_state.is_some(),
            device_state,
            network: payload.get("network").cloned(),
            required_permissions: Vec::new(),
            allow_device_mode: Vec::new(),
            require_device_mode: Vec::new(),
            use_device: true,
            use_ui: true,
            use_empty_passphrase: flag("useEmptyPassphrase", false),
            use_device_state: true,
            keep_session: flag("keepSession", false),
            skip_final_reload: flag("skipFinalReload", false),
            override_previous_call: flag("override", false),
            debug_link: flag("debugLink", false),
        }
    }
}

/// Shared method state every implementation embeds
pub struct MethodCore {
    info: MethodInfo,
    overridden: AtomicBool,
}

impl MethodCore {
    pub fn new(info: MethodInfo) -> Self {
        Self {
            info,
            overridden: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &MethodInfo {
        &self.info
    }

    pub fn overridden(&self) -> bool {
        self.overridden.load(Ordering::SeqCst)
    }

    pub fn set_overridden(&self, overridden: bool) {
        self.overridden.store(overridden, Ordering::SeqCst);
    }
}

/// A request handler for one wallet operation
#[async_trait]
pub trait Method: Send + Sync {
    fn info(&self) -> &MethodInfo;

    /// The call has been preempted by a newer call
    fn overridden(&self) -> bool;

    fn set_overridden(&self, overridden: bool);

    /// Check the device firmware against the method's supported range
    fn check_firmware_range(&self, _using_popup: bool) -> Option<FirmwareException> {
        None
    }

    /// Recompute granted permissions against the host origin
    fn check_permissions(&self) {}

    /// Prompt the user to grant the required permissions
    async fn request_permissions(&self, _ctx: &MethodContext) -> Result<bool, CoreError> {
        Ok(true)
    }

    /// The method asks for an extra confirmation on untrusted hosts
    fn has_confirmation(&self) -> bool {
        false
    }

    async fn confirmation(&self, _ctx: &MethodContext) -> Result<bool, CoreError> {
        Ok(true)
    }

    /// The method asks for confirmation when the seed has no backup
    fn has_no_backup_confirmation(&self) -> bool {
        false
    }

    async fn no_backup_confirmation(&self, _ctx: &MethodContext) -> Result<bool, CoreError> {
        Ok(true)
    }

    /// Extra payload for a button prompt with the given code
    fn button_request_data(&self, _code: &str) -> Option<Value> {
        None
    }

    /// Method-specific protocol definitions to load before running
    fn custom_messages(&self) -> Option<Value> {
        None
    }

    /// Execute the operation, inside a device session when one is open
    async fn run(
        &self,
        ctx: &MethodContext,
        device: Option<Arc<dyn Device>>,
    ) -> Result<Value, CoreError>;

    /// Release method resources
    fn dispose(&self) {}
}

/// Entry points the core exposes to running methods
#[derive(Clone)]
pub struct MethodContext {
    pub(crate) core: Weak<CoreInner>,
}

impl MethodContext {
    /// Emit an outbound message
    pub fn post_message(&self, message: CoreMessage) {
        if let Some(core) = self.core.upgrade() {
            core.emit(message);
        }
    }

    /// Wait for the popup surface to be alive and ready
    pub async fn popup_promise(&self, request_window: bool) -> Result<(), CoreError> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(CoreError::interrupted)?;
        core.popup_promise(request_window).wait().await
    }

    /// Register a pending UI round-trip
    pub fn create_ui_promise(
        &self,
        tag: EventTag,
        device: Option<&Arc<dyn Device>>,
    ) -> Result<Arc<UiPromise>, CoreError> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(CoreError::interrupted)?;
        Ok(core.create_ui_promise(tag, device))
    }

    /// Find the first pending round-trip for a tag
    pub fn find_ui_promise(&self, tag: EventTag) -> Option<Arc<UiPromise>> {
        self.core.upgrade().and_then(|core| core.find_ui_promise(tag))
    }

    /// Drop a round-trip without settling it
    pub fn remove_ui_promise(&self, promise: &Arc<UiPromise>) {
        if let Some(core) = self.core.upgrade() {
            core.remove_ui_promise(promise);
        }
    }
}

/// Factory building a [Method] from a call payload
pub type MethodFactory =
    Box<dyn Fn(u32, &Value) -> Result<Arc<dyn Method>, CoreError> + Send + Sync>;

/// Name-keyed registry of method factories.
///
/// The host registers its wallet operations here before the core starts
/// accepting calls.
#[derive(Default)]
pub struct MethodRegistry {
    factories: HashMap<String, MethodFactory>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(u32, &Value) -> Result<Arc<dyn Method>, CoreError> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Build the method named in the payload
    pub fn create(&self, response_id: u32, payload: &Value) -> Result<Arc<dyn Method>, CoreError> {
        let name = payload
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::new(ErrorCode::MethodInvalidParameter, "method name missing")
            })?;
        let factory = self.factories.get(name).ok_or_else(|| {
            CoreError::new(
                ErrorCode::MethodInvalidParameter,
                format!("method not found: {name}"),
            )
        })?;
        factory(response_id, payload)
    }
}
