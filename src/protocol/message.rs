//! Message model: the four JSON-RPC message kinds and their codec.
//!
//! `params` and `result` are carried as a [`Payload`]: the reserved `_meta`
//! object kept apart from an open map of fields. On the wire both are
//! flattened into one JSON object.
//!
//! # Example
//!
//! ```
//! use rpcwire::protocol::{Message, RequestId};
//!
//! let msg = Message::decode(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
//! assert_eq!(msg.id(), Some(RequestId(1)));
//! assert_eq!(msg.method(), Some("ping"));
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::wire_format::{ErrorObject, RequestId, JSONRPC_VERSION, META_KEY, PROGRESS_TOKEN_KEY};
use crate::error::{Result, RpcError};

/// `params` or `result` body: reserved metadata plus open fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    /// Contents of the reserved `_meta` object, if present.
    pub meta: Option<Map<String, Value>>,
    /// Every other top-level key.
    pub fields: Map<String, Value>,
}

impl Payload {
    /// Empty payload (`{}` on the wire).
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload with the given open fields and no metadata.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { meta: None, fields }
    }

    /// Serialize `value` into the open fields.
    ///
    /// `value` must serialize to a JSON object (or `null`, giving an empty
    /// payload). A `_meta` key in the serialized object is moved to `meta`.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Self::from_object(map),
            other => Err(RpcError::Encode(format!(
                "payload must serialize to a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Split a decoded JSON value into metadata and open fields.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_object(map),
            other => Err(RpcError::InvalidRequest(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn from_object(mut map: Map<String, Value>) -> Result<Self> {
        let meta = match map.remove(META_KEY) {
            None => None,
            Some(Value::Object(meta)) => Some(meta),
            Some(_) => return Err(RpcError::InvalidRequest("invalid _meta".into())),
        };
        Ok(Self { meta, fields: map })
    }

    /// Flatten metadata and fields into one JSON object.
    ///
    /// Fails when an open field is named `_meta`.
    pub fn to_value(&self) -> Result<Value> {
        if self.fields.contains_key(META_KEY) {
            return Err(RpcError::Encode(format!(
                "field {META_KEY:?} collides with the reserved metadata key"
            )));
        }
        let mut out = Map::with_capacity(self.fields.len() + 1);
        if let Some(meta) = &self.meta {
            out.insert(META_KEY.to_string(), Value::Object(meta.clone()));
        }
        for (key, value) in &self.fields {
            out.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(out))
    }

    /// Decode the open fields into a concrete type.
    ///
    /// An empty payload also decodes into types that expect `null` (such as
    /// `()`), so a bare `{}` result can be read as "no value".
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match serde_json::from_value(Value::Object(self.fields.clone())) {
            Ok(value) => Ok(value),
            Err(err) if self.fields.is_empty() => {
                serde_json::from_value(Value::Null).map_err(|_| RpcError::Json(err))
            }
            Err(err) => Err(RpcError::Json(err)),
        }
    }

    /// Set one metadata entry, creating `_meta` if needed.
    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
    }

    /// Look up one metadata entry.
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref().and_then(|meta| meta.get(key))
    }

    /// Progress token attached by the requester, if any.
    pub fn progress_token(&self) -> Option<RequestId> {
        self.meta_value(PROGRESS_TOKEN_KEY)
            .and_then(Value::as_i64)
            .map(RequestId)
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.fields.is_empty()
    }
}

/// A request that expects a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Payload>,
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Payload,
}

/// A one-way message without a reply channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Payload>,
}

/// A failed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub id: RequestId,
    pub error: ErrorObject,
}

/// Any message that can travel over a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
    Error(ErrorMessage),
}

impl Message {
    /// Build a request.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Payload>) -> Self {
        Message::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    /// Build a success reply.
    pub fn response(id: RequestId, result: Payload) -> Self {
        Message::Response(Response { id, result })
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Payload>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Build an error reply.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Message::Error(ErrorMessage { id, error })
    }

    /// Parse one complete message.
    ///
    /// Malformed JSON is a [`RpcError::Parse`]; well-formed JSON that is not a
    /// valid message is a [`RpcError::InvalidRequest`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| RpcError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Serialize to compact JSON bytes (no framing).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value()?)?)
    }

    /// Classify a decoded JSON value.
    ///
    /// `method` + `id` is a request, `method` alone a notification, then
    /// `result` a response, then `error` an error reply.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(RpcError::InvalidRequest(format!(
                    "message must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(RpcError::InvalidRequest(format!(
                    "unsupported jsonrpc version: {other}"
                )))
            }
            None => return Err(RpcError::InvalidRequest("missing jsonrpc version".into())),
        }

        if let Some(method) = obj.remove("method") {
            let method = match method {
                Value::String(m) if !m.is_empty() => m,
                Value::String(_) => {
                    return Err(RpcError::InvalidRequest("no method provided".into()))
                }
                _ => return Err(RpcError::InvalidRequest("method must be a string".into())),
            };
            let params = match obj.remove("params") {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    Payload::from_value(value)
                        .map_err(|_| RpcError::InvalidRequest("invalid params".into()))?,
                ),
            };
            return Ok(match obj.remove("id") {
                Some(id) => Message::Request(Request {
                    id: parse_id(&id)?,
                    method,
                    params,
                }),
                None => Message::Notification(Notification { method, params }),
            });
        }

        if let Some(result) = obj.remove("result") {
            let id = required_id(&obj)?;
            let result = Payload::from_value(result)
                .map_err(|_| RpcError::InvalidRequest("invalid result".into()))?;
            return Ok(Message::Response(Response { id, result }));
        }

        if let Some(error) = obj.remove("error") {
            let id = required_id(&obj)?;
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| RpcError::InvalidRequest(format!("invalid error object: {e}")))?;
            return Ok(Message::Error(ErrorMessage { id, error }));
        }

        Err(RpcError::InvalidRequest(format!(
            "unknown message type: {}",
            Value::Object(obj)
        )))
    }

    /// Build the flattened JSON representation, stamped with the version tag.
    pub fn to_value(&self) -> Result<Value> {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Message::Request(req) => {
                obj.insert("id".into(), Value::from(req.id.0));
                obj.insert("method".into(), Value::String(req.method.clone()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.to_value()?);
                }
            }
            Message::Notification(n) => {
                obj.insert("method".into(), Value::String(n.method.clone()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.to_value()?);
                }
            }
            Message::Response(resp) => {
                obj.insert("id".into(), Value::from(resp.id.0));
                obj.insert("result".into(), resp.result.to_value()?);
            }
            Message::Error(err) => {
                obj.insert("id".into(), Value::from(err.id.0));
                obj.insert("error".into(), serde_json::to_value(&err.error)?);
            }
        }
        Ok(Value::Object(obj))
    }

    /// Request or reply ID, if this message carries one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request(r) => Some(r.id),
            Message::Response(r) => Some(r.id),
            Message::Error(e) => Some(e.id),
            Message::Notification(_) => None,
        }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
            Message::Error(_) => "error",
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn parse_id(value: &Value) -> Result<RequestId> {
    value
        .as_i64()
        .map(RequestId)
        .ok_or_else(|| RpcError::InvalidRequest(format!("invalid id: {value}")))
}

fn required_id(obj: &Map<String, Value>) -> Result<RequestId> {
    match obj.get("id") {
        Some(id) => parse_id(id),
        None => Err(RpcError::InvalidRequest("missing id".into())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        Payload::from_value(value).unwrap()
    }

    #[test]
    fn test_discriminates_request() {
        let msg = Message::decode(br#"{"jsonrpc":"2.0","id":3,"method":"sum","params":{"a":2}}"#)
            .unwrap();
        match msg {
            Message::Request(req) => {
                assert_eq!(req.id, RequestId(3));
                assert_eq!(req.method, "sum");
                assert_eq!(req.params.unwrap().fields["a"], 2);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_discriminates_notification() {
        let msg = Message::decode(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert_eq!(msg.kind(), "notification");
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_method_wins_over_result() {
        let msg =
            Message::decode(br#"{"jsonrpc":"2.0","method":"m","result":{},"id":1}"#).unwrap();
        assert_eq!(msg.kind(), "request");
    }

    #[test]
    fn test_result_wins_over_error() {
        let msg = Message::decode(
            br#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "response");
    }

    #[test]
    fn test_discriminates_error() {
        let msg = Message::decode(
            br#"{"jsonrpc":"2.0","id":9,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match msg {
            Message::Error(err) => {
                assert_eq!(err.id, RequestId(9));
                assert_eq!(err.error.code, -32601);
                assert!(err.error.data.is_none());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_shape_is_invalid_request() {
        let err = Message::decode(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_empty_method_rejected() {
        let err = Message::decode(br#"{"jsonrpc":"2.0","id":1,"method":""}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
        let err = Message::decode(br#"{"jsonrpc":"2.0","method":""}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = Message::decode(br#"{"jsonrpc":"2.0","id":1,"#).unwrap_err();
        assert!(matches!(err, RpcError::Parse(_)));
        assert_eq!(err.code(), -32700);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let err = Message::decode(br#"{"jsonrpc":"1.0","id":1,"method":"m"}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_meta_kept_apart_from_fields() {
        let msg = Message::decode(
            br#"{"jsonrpc":"2.0","id":1,"method":"m","params":{"_meta":{"progressToken":1},"x":true}}"#,
        )
        .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request")
        };
        let params = req.params.unwrap();
        assert_eq!(params.progress_token(), Some(RequestId(1)));
        assert!(!params.fields.contains_key("_meta"));
        assert_eq!(params.fields["x"], true);
    }

    #[test]
    fn test_encode_flattens_meta_and_fields() {
        let mut params = payload(json!({"a": 2, "b": 3}));
        params.set_meta("progressToken", json!(4));
        let msg = Message::request(RequestId(4), "sum", Some(params));

        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "sum",
                "params": {"_meta": {"progressToken": 4}, "a": 2, "b": 3}
            })
        );
    }

    #[test]
    fn test_encode_rejects_meta_collision() {
        let mut fields = Map::new();
        fields.insert("_meta".into(), json!({}));
        let msg = Message::notification("n", Some(Payload::from_fields(fields)));
        assert!(matches!(msg.encode(), Err(RpcError::Encode(_))));
    }

    #[test]
    fn test_round_trip_all_variants() {
        let mut meta_result = payload(json!({"content": [1, 2]}));
        meta_result.set_meta("cursor", json!("abc"));

        let messages = vec![
            Message::request(RequestId(1), "tools/list", Some(payload(json!({"page": 2})))),
            Message::request(RequestId(2), "ping", None),
            Message::response(RequestId(1), meta_result),
            Message::notification("notifications/progress", Some(payload(json!({"progress": 0.5})))),
            Message::error(
                RequestId(5),
                ErrorObject::new(ErrorCode::InvalidParams, "bad")
                    .with_data(json!({"field": "a"})),
            ),
        ];

        for msg in messages {
            let bytes = msg.encode().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_payload_decode_typed() {
        #[derive(Deserialize)]
        struct Sum {
            result: i64,
        }
        let p = payload(json!({"result": 5}));
        assert_eq!(p.decode::<Sum>().unwrap().result, 5);
        Payload::new().decode::<()>().unwrap();
    }

    #[test]
    fn test_payload_from_serialize_requires_object() {
        assert!(Payload::from_serialize(&json!({"a": 1})).is_ok());
        assert!(Payload::from_serialize(&()).unwrap().is_empty());
        assert!(matches!(Payload::from_serialize(&5), Err(RpcError::Encode(_))));
    }

    #[test]
    fn test_message_serde_impls() {
        let msg = Message::notification("n", None);
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
