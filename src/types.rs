use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, ErrorCode};

/// Type tag of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }

    /// Whether a JSON value fits this type tag
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_by_default() -> bool {
    true
}

/// One parameter of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "required_by_default")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ToolParameter {
    /// A required parameter
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Makes the parameter optional, filled with `value` when omitted
    pub fn with_default(mut self, value: Value) -> Self {
        self.required = false;
        self.default = Some(value);
        self
    }

    /// Restricts the parameter to a fixed set of values
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// A named, schema-described operation
///
/// The schema is derived once from the ordered parameter list; `returns` and
/// `examples` are documentation only and never consulted by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            returns: None,
            examples: Vec::new(),
            category: None,
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn returns(mut self, shape: Value) -> Self {
        self.returns = Some(shape);
        self
    }

    pub fn example(mut self, example: Value) -> Self {
        self.examples.push(example);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Checks call arguments against the parameter list
    ///
    /// Rejects missing required parameters, values of the wrong type and values
    /// outside a parameter's enum. Extra arguments pass through untouched.
    pub fn validate_arguments(&self, arguments: &Map<String, Value>) -> Result<(), Error> {
        let mut errors = Vec::new();
        for param in &self.parameters {
            match arguments.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    errors.push(format!("missing required parameter `{}`", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.param_type.matches(value) => {
                    errors.push(format!(
                        "parameter `{}` expects {}, got {}",
                        param.name,
                        param.param_type.as_str(),
                        json_type_name(value)
                    ));
                }
                Some(value) => {
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            errors.push(format!(
                                "parameter `{}` must be one of {}",
                                param.name,
                                Value::Array(allowed.clone())
                            ));
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        Err(Error::protocol_with_data(
            ErrorCode::InvalidParams,
            format!("invalid arguments for tool `{}`: {}", self.name, errors.join("; ")),
            json!({ "tool": self.name, "errors": errors }),
        ))
    }

    /// Fills omitted optional parameters with their defaults
    pub fn apply_defaults(&self, mut arguments: Map<String, Value>) -> Map<String, Value> {
        for param in &self.parameters {
            if let Some(default) = &param.default {
                let missing = matches!(arguments.get(&param.name), None | Some(Value::Null));
                if missing {
                    arguments.insert(param.name.clone(), default.clone());
                }
            }
        }
        arguments
    }

    pub fn to_schema(&self) -> ToolSchema {
        let properties = self
            .parameters
            .iter()
            .map(|p| {
                let property = PropertySchema {
                    param_type: p.param_type,
                    description: (!p.description.is_empty()).then(|| p.description.clone()),
                    enum_values: p.enum_values.clone(),
                    default: p.default.clone(),
                };
                (p.name.clone(), property)
            })
            .collect();

        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: InputSchema {
                schema_type: object_type(),
                properties,
                required: self
                    .required_parameters()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
            returns: self.returns.clone(),
            examples: self.examples.clone(),
            category: self.category.clone(),
        }
    }

    pub fn from_schema(schema: &ToolSchema) -> Self {
        let parameters = schema
            .input_schema
            .properties
            .iter()
            .map(|(name, property)| ToolParameter {
                name: name.clone(),
                param_type: property.param_type,
                description: property.description.clone().unwrap_or_default(),
                required: schema.input_schema.required.contains(name),
                default: property.default.clone(),
                enum_values: property.enum_values.clone(),
            })
            .collect();

        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters,
            returns: schema.returns.clone(),
            examples: schema.examples.clone(),
            category: schema.category.clone(),
        }
    }
}

fn object_type() -> String {
    "object".to_string()
}

/// Exported form of a tool, as carried in `tools/list` and `tools/describe` results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: InputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: IndexMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A resource in the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Unique identifier for the resource
    pub uri: String,
    /// Human-readable name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDefinition {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Resource contents; binary payloads travel base64-encoded in `blob`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ResourceContents {
    pub fn text(uri: impl Into<String>, mime_type: Option<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type,
            text: Some(text.into()),
            blob: None,
        }
    }

    pub fn binary(uri: impl Into<String>, mime_type: Option<String>, bytes: &[u8]) -> Self {
        Self {
            uri: uri.into(),
            mime_type,
            text: None,
            blob: Some(STANDARD.encode(bytes)),
        }
    }

    /// Decodes the `blob` field, if any
    pub fn blob_bytes(&self) -> Result<Option<Vec<u8>>, Error> {
        self.blob
            .as_deref()
            .map(|b| STANDARD.decode(b))
            .transpose()
            .map_err(|e| Error::Other(format!("invalid base64 blob: {e}")))
    }
}

/// A prompt argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A prompt definition: a template with `{argument}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(default)]
    pub template: String,
}

impl PromptDefinition {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
            template: template.into(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn argument(mut self, name: impl Into<String>, required: bool) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: String::new(),
            required,
        });
        self
    }

    /// Substitutes arguments into the template
    pub fn render(&self, arguments: &Map<String, Value>) -> Result<String, Error> {
        let missing: Vec<&str> = self
            .arguments
            .iter()
            .filter(|a| a.required && !arguments.contains_key(&a.name))
            .map(|a| a.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::protocol_with_data(
                ErrorCode::InvalidParams,
                format!("prompt `{}` is missing arguments: {}", self.name, missing.join(", ")),
                json!({ "prompt": self.name, "missing": missing }),
            ));
        }

        let mut text = self.template.clone();
        for (name, value) in arguments {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("{{{name}}}"), &rendered);
        }
        Ok(text)
    }
}

/// Content types for prompt messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageContent {
    #[serde(rename = "text")]
    Text { text: String },
}

/// A prompt message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Optional features a server advertises at handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub streaming: bool,
    pub cancellation: bool,
    pub progress: bool,
    pub multi_tool: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
            streaming: false,
            cancellation: false,
            progress: false,
            multi_tool: false,
        }
    }
}

/// Server description returned by `server/info` and `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            capabilities: Capabilities::default(),
            started_at: None,
        }
    }
}

/// Client implementation information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Logging levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Params of a `notifications/message` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessage {
    pub level: LoggingLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// initialize request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: Implementation,
}

/// initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: ServerInfo,
}

/// tools/list request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// tools/list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
}

/// tools/describe request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeToolParams {
    pub tool: String,
}

/// tools/call request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// tools/call response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub tool: String,
    pub result: Value,
}

/// resources/list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<ResourceDefinition>,
}

/// resources/read request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// resources/read response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// prompts/list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<PromptDefinition>,
}

/// prompts/get request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// prompts/get response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn deploy_tool() -> ToolDefinition {
        ToolDefinition::new("deploy", "Deploy a service")
            .param(ToolParameter::new("service", ParameterType::String).description("service name"))
            .param(
                ToolParameter::new("environment", ParameterType::String)
                    .one_of(["staging", "production"]),
            )
            .param(ToolParameter::new("replicas", ParameterType::Integer).with_default(json!(1)))
            .param(ToolParameter::new("dry_run", ParameterType::Boolean).optional())
            .category("ops")
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    #[test]
    fn schema_export_and_import_preserve_parameters() {
        let tool = deploy_tool();
        let schema = tool.to_schema();
        assert_eq!(schema.input_schema.required, vec!["service", "environment"]);

        let wire = serde_json::to_value(&schema).unwrap();
        assert_eq!(wire["inputSchema"]["type"], "object");
        assert_eq!(wire["inputSchema"]["properties"]["replicas"]["default"], json!(1));
        assert_eq!(
            wire["inputSchema"]["properties"]["environment"]["enum"],
            json!(["staging", "production"])
        );

        let back: ToolSchema = serde_json::from_value(wire).unwrap();
        assert_eq!(ToolDefinition::from_schema(&back), tool);
    }

    #[test]
    fn validation_accepts_only_required_parameters() {
        let tool = deploy_tool();
        tool.validate_arguments(&args(json!({"service": "api", "environment": "staging"})))
            .unwrap();
    }

    #[test]
    fn validation_rejects_missing_required_parameter() {
        let err = deploy_tool()
            .validate_arguments(&args(json!({"environment": "staging"})))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidParams));
        assert!(err.to_string().contains("service"));
    }

    #[test]
    fn validation_rejects_disallowed_enum_value() {
        let err = deploy_tool()
            .validate_arguments(&args(json!({"service": "api", "environment": "moon"})))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidParams));
    }

    #[test]
    fn validation_reports_every_violation() {
        let err = deploy_tool()
            .validate_arguments(&args(json!({"replicas": "three"})))
            .unwrap_err();
        let Error::Protocol { data: Some(data), .. } = err else {
            panic!("expected structured data");
        };
        assert_eq!(data["errors"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn defaults_fill_omitted_parameters() {
        let filled = deploy_tool().apply_defaults(args(json!({"service": "api"})));
        assert_eq!(filled["replicas"], json!(1));
        assert!(!filled.contains_key("dry_run"));
    }

    #[test]
    fn prompt_renders_arguments() {
        let prompt = PromptDefinition::new("greet", "Say hello to {name} in {language}.")
            .argument("name", true)
            .argument("language", false);
        let text = prompt
            .render(&args(json!({"name": "Ada", "language": "French"})))
            .unwrap();
        assert_eq!(text, "Say hello to Ada in French.");

        let err = prompt.render(&Map::new()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidParams));
    }

    #[test]
    fn binary_resources_travel_as_base64() {
        let contents = ResourceContents::binary("mem://logo", Some("image/png".into()), &[0, 159, 146, 150]);
        assert_eq!(contents.blob.as_deref(), Some("AJ+Slg=="));
        assert_eq!(contents.blob_bytes().unwrap(), Some(vec![0, 159, 146, 150]));
    }

    #[test]
    fn capabilities_fill_missing_fields() {
        let caps: Capabilities = serde_json::from_value(json!({"streaming": true})).unwrap();
        assert!(caps.streaming);
        assert!(caps.tools);
        assert!(!caps.multi_tool);
    }
}
