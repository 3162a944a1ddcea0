//! Typed messages and request bodies for the CMake server protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ProtocolError, ProtocolResult};

/// A protocol version advertised by the server in its `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_experimental: bool,
}

impl ProtocolVersion {
    /// Creates a stable protocol version.
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            is_experimental: false,
        }
    }

    /// Picks the version to negotiate from the server's list.
    ///
    /// With a preferred major version, the highest minor of that major is
    /// chosen. Otherwise (or when the major is not offered) the first
    /// advertised version wins.
    pub fn select(supported: &[ProtocolVersion], preferred_major: Option<u32>) -> Option<Self> {
        let preferred = preferred_major.and_then(|major| {
            supported
                .iter()
                .filter(|v| v.major == major)
                .max_by_key(|v| v.minor)
        });
        preferred.or_else(|| supported.first()).copied()
    }

    /// JSON form used inside the `handshake` request.
    pub fn to_value(&self) -> Value {
        let mut value = json!({ "major": self.major, "minor": self.minor });
        if self.is_experimental {
            value["isExperimental"] = Value::Bool(true);
        }
        value
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if self.is_experimental {
            write!(f, " (experimental)")?;
        }
        Ok(())
    }
}

/// A decoded inbound message, classified by its `type` tag.
///
/// Every variant keeps the complete JSON object in `body` so callers can
/// read fields this crate does not model.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server greeting; starts the handshake.
    Hello {
        supported_protocol_versions: Vec<ProtocolVersion>,
        body: Value,
    },
    /// Unsolicited notification, not tied to any request.
    Signal { name: Option<String>, body: Value },
    /// Progress report for an in-flight request.
    Progress { cookie: String, body: Value },
    /// Human-readable message for an in-flight request.
    Message { cookie: String, body: Value },
    /// Successful completion of a request.
    Reply { cookie: String, body: Value },
    /// Failed completion of a request.
    Error {
        cookie: String,
        error_message: String,
        body: Value,
    },
    /// Any other `type`.
    Unknown { kind: String, body: Value },
}

impl Message {
    /// Classifies a decoded JSON object.
    ///
    /// # Errors
    ///
    /// Fails when the value is not an object, lacks a string `type`, or is a
    /// correlated message without a string `cookie`.
    pub fn from_value(body: Value) -> ProtocolResult<Self> {
        let object = body.as_object().ok_or(ProtocolError::NotAnObject)?;
        let kind = required_str(object, "type")?.to_string();

        let message = match kind.as_str() {
            "hello" => {
                let supported_protocol_versions = match object.get("supportedProtocolVersions") {
                    Some(versions) => serde_json::from_value(versions.clone()).map_err(|_| {
                        ProtocolError::InvalidField {
                            field: "supportedProtocolVersions",
                            expected: "a list of protocol versions",
                        }
                    })?,
                    None => Vec::new(),
                };
                Self::Hello {
                    supported_protocol_versions,
                    body,
                }
            }
            "signal" => Self::Signal {
                name: object.get("name").and_then(Value::as_str).map(str::to_string),
                body,
            },
            "progress" => Self::Progress {
                cookie: required_str(object, "cookie")?.to_string(),
                body,
            },
            "message" => Self::Message {
                cookie: required_str(object, "cookie")?.to_string(),
                body,
            },
            "reply" => Self::Reply {
                cookie: required_str(object, "cookie")?.to_string(),
                body,
            },
            "error" => Self::Error {
                cookie: required_str(object, "cookie")?.to_string(),
                error_message: object
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                body,
            },
            other => Self::Unknown {
                kind: other.to_string(),
                body,
            },
        };
        Ok(message)
    }

    /// The `type` tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Signal { .. } => "signal",
            Self::Progress { .. } => "progress",
            Self::Message { .. } => "message",
            Self::Reply { .. } => "reply",
            Self::Error { .. } => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// The correlation cookie, for request-scoped messages.
    pub fn cookie(&self) -> Option<&str> {
        match self {
            Self::Progress { cookie, .. }
            | Self::Message { cookie, .. }
            | Self::Reply { cookie, .. }
            | Self::Error { cookie, .. } => Some(cookie),
            _ => None,
        }
    }

    /// The complete JSON object as received.
    pub fn body(&self) -> &Value {
        match self {
            Self::Hello { body, .. }
            | Self::Signal { body, .. }
            | Self::Progress { body, .. }
            | Self::Message { body, .. }
            | Self::Reply { body, .. }
            | Self::Error { body, .. }
            | Self::Unknown { body, .. } => body,
        }
    }
}

/// Removes the `type` and `cookie` envelope fields from a message object.
pub fn strip_envelope(mut body: Value) -> Value {
    if let Some(object) = body.as_object_mut() {
        object.remove("type");
        object.remove("cookie");
    }
    body
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> ProtocolResult<&'a str> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ProtocolError::InvalidField {
            field,
            expected: "a string",
        }),
        None => Err(ProtocolError::MissingField { field }),
    }
}

/// Progress counters carried by a `progress` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    #[serde(default, rename = "progressMessage")]
    pub message: Option<String>,
    #[serde(default, rename = "progressMinimum")]
    pub minimum: i64,
    #[serde(default, rename = "progressMaximum")]
    pub maximum: i64,
    #[serde(default, rename = "progressCurrent")]
    pub current: i64,
}

impl ProgressInfo {
    /// Reads the progress fields out of a progress body, if they are well formed.
    pub fn from_body(body: &Value) -> Option<Self> {
        Self::deserialize(body).ok()
    }

    /// Completion in the range `0.0..=1.0`, when the range is non-empty.
    pub fn fraction(&self) -> Option<f64> {
        let span = self.maximum - self.minimum;
        if span <= 0 {
            return None;
        }
        let done = (self.current - self.minimum).clamp(0, span);
        Some(done as f64 / span as f64)
    }
}

/// An outbound request body: a `type` tag plus arbitrary fields.
///
/// The `cookie` field is attached by the client when the request is issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    /// Creates a request with no fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builds a request from a JSON object carrying a string `type`.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "type",
                    expected: "a string",
                });
            }
            None => return Err(ProtocolError::MissingField { field: "type" }),
        };
        Ok(Self { kind, fields })
    }

    /// Builder: set a field. A `type` key is ignored; use [`Request::new`].
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// Sets a field in place. A `type` key is ignored.
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value.into());
        }
    }

    /// Builder: attach the correlation cookie.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.fields
            .insert("cookie".to_string(), Value::String(cookie.into()));
        self
    }

    /// The cookie attached to this request, if any.
    pub fn cookie(&self) -> Option<&str> {
        self.fields.get("cookie").and_then(Value::as_str)
    }

    /// The request as a JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        Value::Object(object)
    }

    /// Creates a `globalSettings` request.
    pub fn global_settings() -> Self {
        Self::new("globalSettings")
    }

    /// Creates a `setGlobalSettings` request carrying the given settings.
    pub fn set_global_settings(settings: Map<String, Value>) -> Self {
        let mut request = Self::new("setGlobalSettings");
        for (key, value) in settings {
            request.set_field(key, value);
        }
        request
    }

    /// Creates a `configure` request.
    pub fn configure() -> Self {
        Self::new("configure")
    }

    /// Creates a `configure` request passing `-D`-style cache arguments.
    pub fn configure_with_cache_arguments<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let arguments: Vec<Value> = arguments
            .into_iter()
            .map(|arg| Value::String(arg.into()))
            .collect();
        let request = Self::configure();
        if arguments.is_empty() {
            request
        } else {
            request.with_field("cacheArguments", arguments)
        }
    }

    /// Creates a `compute` request.
    pub fn compute() -> Self {
        Self::new("compute")
    }

    /// Creates a `codemodel` request.
    pub fn codemodel() -> Self {
        Self::new("codemodel")
    }

    /// Creates a `cmakeInputs` request.
    pub fn cmake_inputs() -> Self {
        Self::new("cmakeInputs")
    }

    /// Creates a `cache` request.
    pub fn cache() -> Self {
        Self::new("cache")
    }

    /// Creates a `fileSystemWatchers` request.
    pub fn file_system_watchers() -> Self {
        Self::new("fileSystemWatchers")
    }

    /// Creates a `ctestInfo` request.
    pub fn ctest_info() -> Self {
        Self::new("ctestInfo")
    }
}

/// Parameters of the `handshake` request sent in answer to `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: ProtocolVersion,
    pub source_directory: String,
    pub build_directory: String,
    pub generator: String,
    pub extra_generator: Option<String>,
    pub platform: Option<String>,
    pub toolset: Option<String>,
}

impl Handshake {
    /// Creates a handshake with the mandatory fields.
    pub fn new(
        protocol_version: ProtocolVersion,
        source_directory: impl Into<String>,
        build_directory: impl Into<String>,
        generator: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            source_directory: source_directory.into(),
            build_directory: build_directory.into(),
            generator: generator.into(),
            extra_generator: None,
            platform: None,
            toolset: None,
        }
    }

    /// Converts the handshake into a request body.
    pub fn into_request(self) -> Request {
        let mut request = Request::new("handshake")
            .with_field("protocolVersion", self.protocol_version.to_value())
            .with_field("sourceDirectory", self.source_directory)
            .with_field("buildDirectory", self.build_directory)
            .with_field("generator", self.generator);
        if let Some(extra) = self.extra_generator {
            request.set_field("extraGenerator", extra);
        }
        if let Some(platform) = self.platform {
            request.set_field("platform", platform);
        }
        if let Some(toolset) = self.toolset {
            request.set_field("toolset", toolset);
        }
        request
    }
}

impl From<Handshake> for Request {
    fn from(handshake: Handshake) -> Self {
        handshake.into_request()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses_versions() {
        let body = json!({
            "type": "hello",
            "supportedProtocolVersions": [
                {"isExperimental": true, "major": 1, "minor": 1},
                {"major": 1, "minor": 0}
            ]
        });
        let message = Message::from_value(body).unwrap();
        match message {
            Message::Hello {
                supported_protocol_versions,
                ..
            } => {
                assert_eq!(supported_protocol_versions.len(), 2);
                assert!(supported_protocol_versions[0].is_experimental);
                assert_eq!(supported_protocol_versions[1], ProtocolVersion::new(1, 0));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn hello_with_bad_versions_is_invalid() {
        let body = json!({"type": "hello", "supportedProtocolVersions": "1.0"});
        let result = Message::from_value(body);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField {
                field: "supportedProtocolVersions",
                ..
            })
        ));
    }

    #[test]
    fn correlated_messages_require_cookie() {
        for kind in ["progress", "message", "reply", "error"] {
            let result = Message::from_value(json!({"type": kind}));
            assert!(
                matches!(result, Err(ProtocolError::MissingField { field: "cookie" })),
                "{kind} without cookie"
            );

            let result = Message::from_value(json!({"type": kind, "cookie": 3}));
            assert!(matches!(
                result,
                Err(ProtocolError::InvalidField { field: "cookie", .. })
            ));
        }
    }

    #[test]
    fn type_is_required() {
        let result = Message::from_value(json!({"cookie": "0"}));
        assert!(matches!(
            result,
            Err(ProtocolError::MissingField { field: "type" })
        ));
        let result = Message::from_value(json!(["hello"]));
        assert!(matches!(result, Err(ProtocolError::NotAnObject)));
    }

    #[test]
    fn classification_and_accessors() {
        let reply = Message::from_value(json!({"type": "reply", "cookie": "4", "inReplyTo": "cache"}))
            .unwrap();
        assert_eq!(reply.kind(), "reply");
        assert_eq!(reply.cookie(), Some("4"));
        assert_eq!(reply.body()["inReplyTo"], "cache");

        let error = Message::from_value(
            json!({"type": "error", "cookie": "5", "errorMessage": "No build system"}),
        )
        .unwrap();
        assert!(matches!(
            &error,
            Message::Error { error_message, .. } if error_message == "No build system"
        ));

        let signal = Message::from_value(json!({"type": "signal", "name": "dirty"})).unwrap();
        assert_eq!(signal.cookie(), None);
        assert!(matches!(signal, Message::Signal { name: Some(ref n), .. } if n == "dirty"));

        let unknown = Message::from_value(json!({"type": "bogus"})).unwrap();
        assert_eq!(unknown.kind(), "bogus");
    }

    #[test]
    fn error_without_text_gets_fallback() {
        let error = Message::from_value(json!({"type": "error", "cookie": "1"})).unwrap();
        assert!(matches!(
            error,
            Message::Error { error_message, .. } if error_message == "unknown error"
        ));
    }

    #[test]
    fn strip_envelope_keeps_payload_fields() {
        let reply = json!({
            "type": "reply",
            "cookie": "0",
            "value": {"generators": ["Ninja"]}
        });
        assert_eq!(
            strip_envelope(reply),
            json!({"value": {"generators": ["Ninja"]}})
        );
        assert_eq!(strip_envelope(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn select_protocol_version() {
        let supported = [
            ProtocolVersion::new(1, 0),
            ProtocolVersion::new(2, 0),
            ProtocolVersion::new(1, 2),
        ];
        assert_eq!(
            ProtocolVersion::select(&supported, None),
            Some(ProtocolVersion::new(1, 0))
        );
        assert_eq!(
            ProtocolVersion::select(&supported, Some(1)),
            Some(ProtocolVersion::new(1, 2))
        );
        assert_eq!(
            ProtocolVersion::select(&supported, Some(7)),
            Some(ProtocolVersion::new(1, 0))
        );
        assert_eq!(ProtocolVersion::select(&[], Some(1)), None);
    }

    #[test]
    fn protocol_version_display() {
        assert_eq!(ProtocolVersion::new(1, 0).to_string(), "1.0");
        let experimental = ProtocolVersion {
            is_experimental: true,
            ..ProtocolVersion::new(1, 2)
        };
        assert_eq!(experimental.to_string(), "1.2 (experimental)");
        assert_eq!(experimental.to_value()["isExperimental"], true);
    }

    #[test]
    fn request_serialization() {
        let request = Request::global_settings().with_cookie("0");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"type": "globalSettings", "cookie": "0"}));
        assert_eq!(request.to_value(), value);
        assert_eq!(request.cookie(), Some("0"));
    }

    #[test]
    fn request_ignores_type_field() {
        let request = Request::new("cache").with_field("type", "compute");
        assert_eq!(request.to_value(), json!({"type": "cache"}));
    }

    #[test]
    fn request_from_value() {
        let request = Request::from_value(json!({"type": "cache", "extra": 1})).unwrap();
        assert_eq!(request.kind, "cache");
        assert_eq!(request.fields["extra"], 1);

        assert!(matches!(
            Request::from_value(json!({"extra": 1})),
            Err(ProtocolError::MissingField { field: "type" })
        ));
        assert!(matches!(
            Request::from_value(json!("cache")),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn command_constructors() {
        let kinds = [
            (Request::global_settings(), "globalSettings"),
            (Request::configure(), "configure"),
            (Request::compute(), "compute"),
            (Request::codemodel(), "codemodel"),
            (Request::cmake_inputs(), "cmakeInputs"),
            (Request::cache(), "cache"),
            (Request::file_system_watchers(), "fileSystemWatchers"),
            (Request::ctest_info(), "ctestInfo"),
        ];
        for (request, kind) in kinds {
            assert_eq!(request.kind, kind);
            assert!(request.fields.is_empty());
        }
    }

    #[test]
    fn set_global_settings_copies_fields() {
        let mut settings = Map::new();
        settings.insert("debugOutput".into(), Value::Bool(true));
        settings.insert("type".into(), Value::String("ignored".into()));

        let request = Request::set_global_settings(settings);
        assert_eq!(
            request.to_value(),
            json!({"type": "setGlobalSettings", "debugOutput": true})
        );
    }

    #[test]
    fn configure_cache_arguments() {
        let request = Request::configure_with_cache_arguments(["-DFOO=1", "-DBAR=ON"]);
        assert_eq!(request.fields["cacheArguments"], json!(["-DFOO=1", "-DBAR=ON"]));

        let request = Request::configure_with_cache_arguments(Vec::<String>::new());
        assert!(request.fields.is_empty());
    }

    #[test]
    fn progress_info() {
        let body = json!({
            "type": "progress",
            "cookie": "2",
            "inReplyTo": "configure",
            "progressMessage": "Configuring",
            "progressMinimum": 0,
            "progressMaximum": 1000,
            "progressCurrent": 250
        });
        let info = ProgressInfo::from_body(&body).unwrap();
        assert_eq!(info.message.as_deref(), Some("Configuring"));
        assert_eq!(info.fraction(), Some(0.25));

        let empty = ProgressInfo::default();
        assert_eq!(empty.fraction(), None);
    }

    #[test]
    fn handshake_request_body() {
        let handshake = Handshake::new(
            ProtocolVersion::new(1, 0),
            "/src/demo",
            "/tmp/build",
            "Unix Makefiles",
        );
        let request = Request::from(handshake);

        insta::assert_json_snapshot!(request, @r#"
        {
          "type": "handshake",
          "buildDirectory": "/tmp/build",
          "generator": "Unix Makefiles",
          "protocolVersion": {
            "major": 1,
            "minor": 0
          },
          "sourceDirectory": "/src/demo"
        }
        "#);
    }

    #[test]
    fn handshake_optional_fields() {
        let mut handshake = Handshake::new(ProtocolVersion::new(1, 1), "/s", "/b", "Ninja");
        handshake.extra_generator = Some("CodeBlocks".into());
        handshake.platform = Some("x64".into());
        handshake.toolset = Some("v142".into());

        let value = handshake.into_request().to_value();
        assert_eq!(value["extraGenerator"], "CodeBlocks");
        assert_eq!(value["platform"], "x64");
        assert_eq!(value["toolset"], "v142");
        assert_eq!(value["protocolVersion"], json!({"major": 1, "minor": 1}));
    }
}
