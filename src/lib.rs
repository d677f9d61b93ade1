// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Hardware wallet client bridge, core session orchestrator
//!
//! Mediates between an untrusted caller, a trusted popup UI surface, and
//! physical signing devices behind a pluggable transport. A single inbound
//! method call becomes a correctly sequenced device interaction: select a
//! device, acquire exclusive access, gate on firmware, mode, and
//! permissions, collect user secrets through UI round-trips, execute the
//! method, and deliver exactly one response.
//!
//! Wallet methods, the device enumerator, and the popup itself are
//! external collaborators; they plug in through the [method::Method],
//! [device::Device], [device::DeviceList], and [device::Transport] traits.

pub mod core;
pub mod deferred;
pub mod device;
pub mod emitter;
pub mod error;
pub mod message;
pub mod method;
pub mod settings;
pub mod timeout;

mod bridge;
mod dispatch;
mod selection;

pub use crate::core::{CallInfo, Core};
pub use deferred::{Deferred, UiPromise, UiResponse};
pub use error::{
    CoreError, ErrorCode, INVALID_PIN_ERROR_MESSAGE, WRONG_PREVIOUS_SESSION_ERROR_MESSAGE,
};
pub use message::{CoreMessage, EventTag, MessageEvent};
pub use method::{Method, MethodContext, MethodCore, MethodInfo, MethodRegistry, Permission};
pub use settings::Settings;
