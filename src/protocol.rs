use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::error::{Error, ErrorCode};

/// The protocol version spoken by this SDK
///
/// Exchanged during the `initialize` handshake. A peer answering with a version
/// outside [`SUPPORTED_PROTOCOL_VERSIONS`] is tolerated; the client only logs it.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// List of all protocol versions this SDK accepts, most recent first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION, "2024-11-05"];

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// JSON-RPC version carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// The closed set of methods a server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Shutdown,
    ServerInfo,
    ServerCapabilities,
    ListTools,
    DescribeTool,
    CallTool,
    ListResources,
    ReadResource,
    ListPrompts,
    GetPrompt,
}

impl Method {
    pub const ALL: [Method; 11] = [
        Method::Initialize,
        Method::Shutdown,
        Method::ServerInfo,
        Method::ServerCapabilities,
        Method::ListTools,
        Method::DescribeTool,
        Method::CallTool,
        Method::ListResources,
        Method::ReadResource,
        Method::ListPrompts,
        Method::GetPrompt,
    ];

    /// The method name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::Shutdown => "shutdown",
            Method::ServerInfo => "server/info",
            Method::ServerCapabilities => "server/capabilities",
            Method::ListTools => "tools/list",
            Method::DescribeTool => "tools/describe",
            Method::CallTool => "tools/call",
            Method::ListResources => "resources/list",
            Method::ReadResource => "resources/read",
            Method::ListPrompts => "prompts/list",
            Method::GetPrompt => "prompts/get",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::protocol(ErrorCode::MethodNotFound, format!("method not found: {s}")))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A correlation id
///
/// Either a string or a number, as per JSON-RPC 2.0. `Null` only appears on error
/// responses to input whose id could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
    Null,
}

/// A request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the method to be invoked
    pub method: String,
    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Unique identifier for the request
    pub id: RequestId,
}

/// A notification envelope: a request without an id, never answered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the event or method
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A response envelope
///
/// Carries exactly one of `result` and `error`. A `result` of JSON null is a
/// present result, not a missing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// ID of the request this response corresponds to
    pub id: RequestId,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// Error object of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any envelope that can cross a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Deserializes the params into `T`, treating absent params as an empty object
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        parse_params(self.params.clone())
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwraps the response into its result, or the protocol error it carries
    pub fn into_result(self) -> Result<Value, Error> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        self.result.ok_or_else(|| {
            Error::protocol(ErrorCode::InvalidRequest, "response carries neither result nor error")
        })
    }
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl Message {
    /// The correlation id, absent on notifications
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Notification(_) => None,
        }
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Error::Protocol {
            code: err.code(),
            message: err.message,
            data: err.data,
        }
    }
}

impl From<Error> for ResponseError {
    fn from(err: Error) -> Self {
        match err {
            Error::Protocol {
                code,
                message,
                data,
            } => ResponseError {
                code: code.into(),
                message,
                data,
            },
            other => ResponseError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Null => f.write_str("null"),
        }
    }
}

/// Deserializes method params, treating absent params as an empty object
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, Error> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(p) => p,
    };
    serde_json::from_value(params).map_err(|e| {
        Error::protocol(ErrorCode::InvalidParams, format!("invalid params: {e}"))
    })
}

/// Why an inbound frame could not be decoded
///
/// Carries the id when one could still be read, so the answering error response
/// can be correlated; otherwise the id is null.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub id: RequestId,
    pub error: ResponseError,
}

impl DecodeError {
    fn parse(detail: impl fmt::Display) -> Self {
        Self {
            id: RequestId::Null,
            error: ResponseError {
                code: ErrorCode::ParseError.into(),
                message: "parse error".to_string(),
                data: Some(serde_json::json!({ "detail": detail.to_string() })),
            },
        }
    }

    fn invalid(id: RequestId, detail: impl Into<String>) -> Self {
        Self {
            id,
            error: ResponseError::new(ErrorCode::InvalidRequest, detail),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }

    /// The error response a server sends back for this frame
    pub fn into_response(self) -> Response {
        Response::error(self.id, self.error)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error.code(), self.error.message)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        err.error.into()
    }
}

/// Encodes an envelope to its transmissible form
pub fn encode(message: &Message) -> Result<String, Error> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes one frame into an envelope
///
/// Never panics on malformed input: non-JSON is a parse error, anything else that
/// is not a well-formed envelope is an invalid request.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::parse)?;
    let Value::Object(obj) = &value else {
        return Err(DecodeError::invalid(RequestId::Null, "envelope must be a JSON object"));
    };

    let id = obj
        .get("id")
        .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());
    let id_or_null = id.clone().unwrap_or(RequestId::Null);

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(DecodeError::invalid(id_or_null, "missing or unsupported version tag"));
    }

    if obj.contains_key("method") {
        let message = if obj.contains_key("id") {
            serde_json::from_value(value.clone()).map(Message::Request)
        } else {
            serde_json::from_value(value.clone()).map(Message::Notification)
        };
        return message.map_err(|e| DecodeError::invalid(id_or_null, e.to_string()));
    }

    match (obj.contains_key("result"), obj.contains_key("error")) {
        (true, true) => Err(DecodeError::invalid(
            id_or_null,
            "response carries both result and error",
        )),
        (false, false) => Err(DecodeError::invalid(
            id_or_null,
            "envelope is neither a request nor a response",
        )),
        _ => serde_json::from_value(value.clone())
            .map(Message::Response)
            .map_err(|e| DecodeError::invalid(id_or_null, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_creation() {
        let id = RequestId::Number(1);
        let params = Some(json!({"key": "value"}));
        let request = Request::new("tools/list", params.clone(), id.clone());

        assert_eq!(request.jsonrpc, JSONRPC_VERSION);
        assert_eq!(request.method, "tools/list");
        assert_eq!(request.params, params);
        assert_eq!(request.id, id);
    }

    #[test]
    fn test_response_error() {
        let id = RequestId::Number(123);
        let error = ResponseError {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: Some(json!({"details": "missing method"})),
        };
        let response = Response::error(id.clone(), error.clone());

        assert_eq!(response.id, id);
        assert!(response.result.is_none());
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::String("test-id".to_string()).to_string(), "test-id");
        assert_eq!(RequestId::Null.to_string(), "null");
    }

    #[test]
    fn method_names_parse_back() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        let err = "tools/explode".parse::<Method>().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MethodNotFound));
    }

    #[test]
    fn request_survives_encode_decode() {
        let request = Request::new(
            Method::CallTool.as_str(),
            Some(json!({"tool": "echo", "arguments": {"message": "hi"}})),
            RequestId::String("req-7".into()),
        );
        let text = encode(&Message::Request(request.clone())).unwrap();
        let Message::Request(decoded) = decode(&text).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(decoded.method, request.method);
        assert_eq!(decoded.params, request.params);
        assert_eq!(decoded.id, request.id);
    }

    #[test]
    fn frames_are_classified_by_shape() {
        let n = decode(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#).unwrap();
        assert!(matches!(n, Message::Notification(_)));
        assert!(n.id().is_none());

        let r = decode(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(r, Message::Response(_)));
        assert_eq!(r.id(), Some(&RequestId::Number(3)));
    }

    #[test]
    fn null_result_is_still_a_result() {
        let Message::Response(r) = decode(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap()
        else {
            panic!("expected a response");
        };
        assert_eq!(r.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn garbage_is_a_parse_error_with_null_id() {
        let err = decode("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParseError);
        let response = err.into_response();
        assert_eq!(response.id, RequestId::Null);
        let text = serde_json::to_value(&response).unwrap();
        assert_eq!(text["id"], Value::Null);
        assert_eq!(text["error"]["code"], json!(-32700));
    }

    #[test]
    fn malformed_envelopes_keep_their_id() {
        let err = decode(r#"{"jsonrpc":"1.0","id":9,"method":"tools/list"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.id, RequestId::Number(9));

        let err = decode(r#"{"jsonrpc":"2.0","id":4,"result":1,"error":{"code":1,"message":"x"}}"#)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.id, RequestId::Number(4));

        let err = decode("[1,2]").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.id, RequestId::Null);
    }

    #[test]
    fn older_listed_versions_are_supported() {
        assert!(is_supported_version(PROTOCOL_VERSION));
        assert!(is_supported_version("2024-11-05"));
        assert!(!is_supported_version("1999-01-01"));
        assert!(!is_supported_version(""));
    }

    #[test]
    fn absent_params_parse_as_empty_object() {
        #[derive(Deserialize)]
        struct P {
            #[serde(default)]
            category: Option<String>,
        }
        let p: P = parse_params(None).unwrap();
        assert!(p.category.is_none());
        let err = parse_params::<P>(Some(json!({"category": 5}))).err().unwrap();
        assert_eq!(err.code(), Some(ErrorCode::InvalidParams));
    }
}
