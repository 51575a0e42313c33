//! JSON-RPC 2.0 data types used on every transport.
//!
//! The gateway treats method names and payloads as opaque except for the
//! `initialize` request, which drives the session lifecycle. Messages arrive
//! either as a single value or as a batch (JSON array); classification
//! follows the shape of the value: `id` + `method` is a request, `method`
//! alone a notification, `id` + `result` a response, `id` + `error` an error.

mod message;

pub use message::{
    ClientPayload, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion2_0, NumberOrString, RequestId,
};

/// The MCP lifecycle method that creates a session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// The client notification acknowledging a completed initialization.
pub const INITIALIZED_NOTIFICATION_METHOD: &str = "notifications/initialized";
