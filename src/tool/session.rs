//! Session seam between the client state machine and the tool.
//!
//! A [`Connector`] produces a live [`Session`]; the client owns it until
//! disconnect. [`McpSession`] is the protocol implementation over any
//! [`RpcTransport`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::error::{CallError, CallResult, ConnectError, TransportError, TransportResult};
use super::protocol::{
    methods, CallToolParams, CallToolResult, Content, Implementation, InitializeParams,
    InitializeResult, ListToolsResult, ToolInfo,
};
use super::transport::RpcTransport;

/// A live, handshaken connection to the tool.
#[async_trait]
pub trait Session: Send + Sync {
    /// Forward one verb with its parameters and wait for the result.
    async fn call_tool(&self, verb: &str, arguments: Map<String, Value>) -> CallResult<Response>;

    /// List the verbs the tool advertises.
    async fn list_tools(&self) -> CallResult<Vec<ToolInfo>>;

    /// Tear the session down. Must be safe to call more than once.
    async fn shutdown(&self) -> TransportResult<()>;

    /// Identity reported by the tool during the handshake.
    fn server_info(&self) -> Option<Implementation> {
        None
    }
}

/// Produces sessions. One call is one connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start the tool and complete the handshake.
    ///
    /// Dropping the returned future must release anything it started.
    async fn connect(&self) -> Result<Box<dyn Session>, ConnectError>;
}

// ============================================================================
// Response
// ============================================================================

/// Payload returned by a verb.
///
/// The tool answers with content parts (usually JSON text) and optionally a
/// structured value. Callers pick the view they need.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    content: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    structured: Option<Value>,
}

impl Response {
    /// Build a response from a list of JSON records.
    pub fn from_records(records: Vec<Value>) -> Self {
        Self {
            content: Vec::new(),
            structured: Some(Value::Array(records)),
        }
    }

    /// Build a response holding a single text part.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            structured: None,
        }
    }

    /// Raw content parts.
    pub fn content(&self) -> &[Content] {
        &self.content
    }

    /// Whether the tool returned nothing at all.
    pub fn is_empty(&self) -> bool {
        self.structured.is_none() && self.content.is_empty()
    }

    /// Text parts joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The payload as a list of records.
    ///
    /// Structured content wins when present. Otherwise each text part is
    /// parsed as JSON: arrays are flattened, other values kept as one record,
    /// and text that is not JSON becomes a string record. Blank parts are
    /// skipped.
    pub fn records(&self) -> Vec<Value> {
        if let Some(structured) = &self.structured {
            return match structured {
                Value::Array(items) => items.clone(),
                Value::Object(map) => match map.get("result") {
                    Some(Value::Array(items)) if map.len() == 1 => items.clone(),
                    _ => vec![structured.clone()],
                },
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
        }

        let mut records = Vec::new();
        for part in &self.content {
            let Content::Text { text } = part else {
                continue;
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(items)) => records.extend(items),
                Ok(Value::Null) => {}
                Ok(value) => records.push(value),
                Err(_) => records.push(Value::String(text.to_string())),
            }
        }
        records
    }

    /// JSON view for HTTP bodies: a single record stays an object, anything
    /// else is an array.
    pub fn to_json(&self) -> Value {
        let mut records = self.records();
        if records.len() == 1 {
            records.remove(0)
        } else {
            Value::Array(records)
        }
    }
}

impl From<CallToolResult> for Response {
    fn from(result: CallToolResult) -> Self {
        Self {
            content: result.content,
            structured: result.structured_content,
        }
    }
}

// ============================================================================
// MCP session
// ============================================================================

/// Protocol session over a transport.
pub struct McpSession {
    transport: RpcTransport,
    server: InitializeResult,
}

impl McpSession {
    /// Perform the `initialize` / `notifications/initialized` exchange.
    pub async fn handshake(transport: RpcTransport) -> TransportResult<Self> {
        let params = to_params(&InitializeParams::default())?;
        let server: InitializeResult = transport.request(methods::INITIALIZE, Some(params)).await?;
        transport.notify(methods::INITIALIZED, None).await?;

        match &server.server_info {
            Some(info) => info!(
                server = %info.name,
                version = %info.version,
                protocol = %server.protocol_version,
                "handshake complete"
            ),
            None => info!(protocol = %server.protocol_version, "handshake complete"),
        }
        if let Some(instructions) = &server.instructions {
            debug!(%instructions, "tool instructions");
        }

        Ok(Self { transport, server })
    }

    /// Whether the tool is still connected.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

#[async_trait]
impl Session for McpSession {
    async fn call_tool(&self, verb: &str, arguments: Map<String, Value>) -> CallResult<Response> {
        let params = to_params(&CallToolParams {
            name: verb.to_string(),
            arguments,
        })?;

        let result: CallToolResult = self
            .transport
            .request(methods::TOOLS_CALL, Some(params))
            .await
            .map_err(|err| match err {
                TransportError::Rpc { code, message } => {
                    CallError::failed(verb, format!("{} (code: {})", message, code))
                }
                other => CallError::Transport(other),
            })?;

        if result.is_error {
            let response = Response::from(result);
            return Err(CallError::failed(verb, response.text()));
        }
        Ok(Response::from(result))
    }

    async fn list_tools(&self) -> CallResult<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .take()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult = self
                .transport
                .request(methods::TOOLS_LIST, params)
                .await
                .map_err(|err| match err {
                    TransportError::Rpc { code, message } => CallError::failed(
                        methods::TOOLS_LIST,
                        format!("{} (code: {})", message, code),
                    ),
                    other => CallError::Transport(other),
                })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    async fn shutdown(&self) -> TransportResult<()> {
        if !self.transport.is_alive() {
            return Ok(());
        }
        self.transport.close().await
    }

    fn server_info(&self) -> Option<Implementation> {
        self.server.server_info.clone()
    }
}

fn to_params<T: Serialize>(params: &T) -> TransportResult<Value> {
    serde_json::to_value(params).map_err(TransportError::SerializeFailed)
}
