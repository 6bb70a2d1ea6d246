//! Kurento JSON-RPC 2.0 wire types

use crate::backend::{EndpointSpec, ObjectId};
use crate::protocol::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Kurento module owning the core element types
const KURENTO_MODULE: &str = "kurento";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    pub params: Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value, id: Option<u64>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ErrorObject> for Error {
    fn from(e: ErrorObject) -> Self {
        Error::BackendError {
            code: e.code,
            message: e.message,
        }
    }
}

/// Any frame received from the backend: a response or a notification
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<ErrorObject>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub params: Option<Value>,
}

impl IncomingFrame {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize backend frame: {}", e))
        })
    }
}

/// Event notification raised by a backend object
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotification {
    /// Object that raised the event
    pub object: String,

    /// Event type name
    pub event_type: String,

    /// Event payload
    pub data: Value,
}

impl EventNotification {
    /// Extract an event from `onEvent` notification params
    pub fn from_params(params: &Value) -> Option<Self> {
        let value = params.get("value")?;
        let event_type = value.get("type")?.as_str()?.to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let object = value
            .get("object")
            .and_then(Value::as_str)
            .or_else(|| data.get("source").and_then(Value::as_str))?
            .to_string();

        Some(Self {
            object,
            event_type,
            data,
        })
    }

    /// Candidate carried by an `IceCandidateFound` event
    pub fn candidate(&self) -> Option<IceCandidate> {
        serde_json::from_value(self.data.get("candidate")?.clone()).ok()
    }
}

pub fn create_params(type_name: &str, constructor_params: Value) -> Value {
    json!({
        "type": type_name,
        "constructorParams": constructor_params,
        "properties": {}
    })
}

/// `create` params for an endpoint inside `pipeline`
pub fn endpoint_params(pipeline: &ObjectId, spec: &EndpointSpec) -> Value {
    let constructor = match spec {
        EndpointSpec::WebRtc => json!({ "mediaPipeline": pipeline.as_str() }),
        EndpointSpec::Recorder { uri } | EndpointSpec::Player { uri } => {
            json!({ "mediaPipeline": pipeline.as_str(), "uri": uri })
        }
    };
    create_params(spec.kind().type_name(), constructor)
}

pub fn invoke_params(object: &ObjectId, operation: &str, operation_params: Option<Value>) -> Value {
    let mut params = json!({
        "object": object.as_str(),
        "operation": operation
    });
    if let Some(operation_params) = operation_params {
        params["operationParams"] = operation_params;
    }
    params
}

pub fn subscribe_params(object: &ObjectId, event_type: &str) -> Value {
    json!({ "type": event_type, "object": object.as_str() })
}

pub fn release_params(object: &ObjectId) -> Value {
    json!({ "object": object.as_str() })
}

/// `IceCandidate` complex type as the backend expects it
pub fn candidate_value(candidate: &IceCandidate) -> Value {
    let mut value = json!({
        "__module__": KURENTO_MODULE,
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
    });
    if let Some(sdp_mid) = &candidate.sdp_mid {
        value["sdpMid"] = json!(sdp_mid);
    }
    if let Some(index) = candidate.sdp_m_line_index {
        value["sdpMLineIndex"] = json!(index);
    }
    value
}

/// Wrap operations in `transaction` params; the backend applies them atomically
pub fn transaction_params(operations: &[(&str, Value)]) -> Value {
    let operations: Vec<JsonRpcRequest> = operations
        .iter()
        .enumerate()
        .map(|(index, (method, params))| JsonRpcRequest::new(method, params.clone(), Some(index as u64)))
        .collect();
    json!({ "operations": operations })
}

/// Split a `transaction` result into the per-operation values
///
/// Each element is either a full response (`{"result": {"value": ..}}` or
/// `{"error": ..}`) or a bare `{"value": ..}`.
pub fn transaction_values(value: Value, expected: usize) -> Result<Vec<Value>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::UnexpectedResponse(format!(
                "transaction result is not an array: {}",
                other
            )))
        }
    };

    if items.len() != expected {
        return Err(Error::UnexpectedResponse(format!(
            "transaction returned {} results for {} operations",
            items.len(),
            expected
        )));
    }

    items
        .into_iter()
        .map(|item| {
            if let Some(error) = item.get("error") {
                let error: ErrorObject = serde_json::from_value(error.clone())?;
                return Err(error.into());
            }
            let result = item.get("result").unwrap_or(&item);
            Ok(result.get("value").cloned().unwrap_or(Value::Null))
        })
        .collect()
}

/// Interpret a result value as an object reference
pub fn object_id(value: &Value) -> Result<ObjectId> {
    value
        .as_str()
        .map(ObjectId::new)
        .ok_or_else(|| Error::UnexpectedResponse(format!("expected object id, got {}", value)))
}
