//! Protocol frames.
//!
//! Every frame is one JSON object. `type` decides which of the remaining
//! fields are meaningful; the router reads only `type`, `id`, `destination`,
//! `route` and `uuid`, and never looks inside `data`.

use crate::{FunctionCallData, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The closed set of frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    Verification,
    Ping,
    Request,
    Response,
    Error,
    Information,
    ClientList,
    FunctionCall,
    Success,
}

impl PayloadType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Ping => "ping",
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::Information => "information",
            Self::ClientList => "client_list",
            Self::FunctionCall => "function_call",
            Self::Success => "success",
        }
    }

    /// Whether the router must route this frame to a `destination`.
    pub fn is_addressed(self) -> bool {
        matches!(
            self,
            Self::Request | Self::Response | Self::Error | Self::FunctionCall
        )
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `route` field: an operation name on requests, a destination list on
/// information frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Route {
    Name(String),
    Destinations(Vec<String>),
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: PayloadType,
    /// Logical identifier of the sender.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Correlation id, echoed by every reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Set on responses whose `data` is an [`ObjectDescriptor`](crate::ObjectDescriptor).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pseudo_object: bool,
}

impl MessagePayload {
    /// A bare frame of the given kind from `id`.
    pub fn new(kind: PayloadType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            destination: None,
            route: None,
            uuid: None,
            data: Value::Null,
            traceback: None,
            pseudo_object: false,
        }
    }

    pub fn verification(id: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self::new(PayloadType::Verification, id).with_uuid(uuid)
    }

    pub fn success(id: impl Into<String>) -> Self {
        Self::new(PayloadType::Success, id)
    }

    pub fn ping(id: impl Into<String>, destination: Option<String>, uuid: impl Into<String>) -> Self {
        let mut frame = Self::new(PayloadType::Ping, id).with_uuid(uuid);
        frame.destination = destination;
        frame
    }

    pub fn client_list(id: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self::new(PayloadType::ClientList, id).with_uuid(uuid)
    }

    pub fn request(
        id: impl Into<String>,
        destination: impl Into<String>,
        route: impl Into<String>,
        data: Value,
        uuid: impl Into<String>,
    ) -> Self {
        let mut frame = Self::new(PayloadType::Request, id)
            .with_destination(destination)
            .with_uuid(uuid);
        frame.route = Some(Route::Name(route.into()));
        frame.data = data;
        frame
    }

    pub fn response(
        id: impl Into<String>,
        destination: impl Into<String>,
        uuid: Option<String>,
        data: Value,
    ) -> Self {
        let mut frame = Self::new(PayloadType::Response, id).with_destination(destination);
        frame.uuid = uuid;
        frame.data = data;
        frame
    }

    pub fn error(
        id: impl Into<String>,
        destination: Option<String>,
        uuid: Option<String>,
        message: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        let mut frame = Self::new(PayloadType::Error, id);
        frame.destination = destination;
        frame.uuid = uuid;
        frame.data = Value::String(message.into());
        frame.traceback = traceback;
        frame
    }

    /// An information frame. `None` broadcasts to every other active peer.
    pub fn information(id: impl Into<String>, destinations: Option<Vec<String>>, data: Value) -> Self {
        let mut frame = Self::new(PayloadType::Information, id);
        frame.route = destinations.map(Route::Destinations);
        frame.data = data;
        frame
    }

    pub fn function_call(
        id: impl Into<String>,
        destination: impl Into<String>,
        uuid: impl Into<String>,
        call: &FunctionCallData,
    ) -> Result<Self, ProtocolError> {
        let mut frame = Self::new(PayloadType::FunctionCall, id)
            .with_destination(destination)
            .with_uuid(uuid);
        frame.data = serde_json::to_value(call)?;
        Ok(frame)
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// An error frame answering this one: addressed back to the sender and
    /// echoing its correlation id.
    pub fn error_reply(
        &self,
        local: impl Into<String>,
        message: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        Self::error(
            local,
            Some(self.id.clone()),
            self.uuid.clone(),
            message,
            traceback,
        )
    }

    /// A response frame answering this one.
    pub fn response_reply(&self, local: impl Into<String>, data: Value) -> Self {
        Self::response(local, self.id.clone(), self.uuid.clone(), data)
    }

    /// The operation name of a request.
    pub fn route_name(&self) -> Option<&str> {
        match &self.route {
            Some(Route::Name(name)) => Some(name),
            _ => None,
        }
    }

    /// The destination subset of an information frame.
    pub fn destinations(&self) -> Option<&[String]> {
        match &self.route {
            Some(Route::Destinations(list)) => Some(list),
            Some(Route::Name(name)) => Some(std::slice::from_ref(name)),
            None => None,
        }
    }

    /// `data` as text, as carried by error frames.
    pub fn message(&self) -> Option<&str> {
        self.data.as_str()
    }

    /// Decode the `data` of a function call frame.
    pub fn function_call_data(&self) -> Result<FunctionCallData, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::Malformed {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_tag_is_snake_case() {
        let frame = MessagePayload::client_list("shard-1", "abc");
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "client_list");
        assert_eq!(value["id"], "shard-1");
        assert_eq!(value["uuid"], "abc");
    }

    #[test]
    fn absent_fields_are_omitted() {
        let encoded = MessagePayload::success("router").encode().unwrap();
        assert_eq!(encoded, r#"{"type":"success","id":"router"}"#);
    }

    #[test]
    fn decodes_nulls_from_loose_senders() {
        let frame = MessagePayload::decode(
            r#"{"type":"request","id":"a","destination":"b","route":"echo",
                "uuid":"u1","data":{"value":42},"traceback":null}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, PayloadType::Request);
        assert_eq!(frame.route_name(), Some("echo"));
        assert_eq!(frame.data, json!({"value": 42}));
        assert_eq!(frame.traceback, None);
        assert!(!frame.pseudo_object);
    }

    #[test]
    fn information_route_is_a_destination_list() {
        let frame = MessagePayload::information(
            "a",
            Some(vec!["b".to_string(), "c".to_string()]),
            json!("hi"),
        );
        let decoded = MessagePayload::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.destinations(),
            Some(&["b".to_string(), "c".to_string()][..])
        );
        assert_eq!(decoded.route_name(), None);
    }

    #[test]
    fn error_reply_echoes_correlation() {
        let request = MessagePayload::request("a", "b", "missing", Value::Null, "u7");
        let reply = request.error_reply("b", "Route not found", None);
        assert_eq!(reply.kind, PayloadType::Error);
        assert_eq!(reply.destination.as_deref(), Some("a"));
        assert_eq!(reply.uuid.as_deref(), Some("u7"));
        assert_eq!(reply.message(), Some("Route not found"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(MessagePayload::decode(r#"{"type":"teleport","id":"a"}"#).is_err());
    }

    #[test]
    fn addressed_kinds() {
        assert!(PayloadType::Request.is_addressed());
        assert!(PayloadType::FunctionCall.is_addressed());
        assert!(!PayloadType::Information.is_addressed());
        assert!(!PayloadType::Ping.is_addressed());
    }
}
