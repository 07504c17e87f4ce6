use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 message sent by the editor (request or notification)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC ID can be string or number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

/// JSON-RPC Error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl JsonRpcRequest {
    /// Build an outgoing notification (no id)
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Check if this is an initialize request
    pub fn is_initialize(&self) -> bool {
        self.method == "initialize"
    }

    /// Check if this is a shutdown request
    pub fn is_shutdown(&self) -> bool {
        self.method == "shutdown"
    }

    /// Check if this is an exit notification
    pub fn is_exit(&self) -> bool {
        self.method == "exit"
    }

    /// Workspace root announced by `initialize`.
    ///
    /// `rootUri` wins over the deprecated `rootPath`; the first workspace folder
    /// is used when neither is set.
    pub fn get_root(&self) -> Option<String> {
        let params = self.params.as_ref()?;

        if let Some(uri) = params.get("rootUri").and_then(|v| v.as_str()) {
            return Some(uri.to_string());
        }
        if let Some(path) = params.get("rootPath").and_then(|v| v.as_str()) {
            return Some(path.to_string());
        }
        params
            .get("workspaceFolders")
            .and_then(|f| f.as_array())
            .and_then(|arr| arr.first())
            .and_then(|folder| folder.get("uri"))
            .and_then(|u| u.as_str())
            .map(|s| s.to_string())
    }

    /// First folder added by `workspace/didChangeWorkspaceFolders`
    pub fn get_added_folder(&self) -> Option<String> {
        self.params
            .as_ref()?
            .get("event")?
            .get("added")?
            .as_array()?
            .first()?
            .get("uri")?
            .as_str()
            .map(|s| s.to_string())
    }

    /// Try to extract a document URI from the request params
    pub fn get_uri(&self) -> Option<String> {
        let params = self.params.as_ref()?;

        if let Some(uri) = params.get("uri").and_then(|v| v.as_str()) {
            return Some(uri.to_string());
        }
        params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Document version carried by `textDocument/didChange`, 0 when absent
    pub fn get_version(&self) -> i64 {
        self.params
            .as_ref()
            .and_then(|p| p.get("textDocument"))
            .and_then(|td| td.get("version"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "initialize");
        assert_eq!(req.id, Some(JsonRpcId::Number(1)));
    }

    #[test]
    fn test_parse_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"exit"}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert!(req.is_notification());
        assert!(req.is_exit());
    }

    #[test]
    fn test_root_prefers_root_uri() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{
            "rootPath":"/old","rootUri":"file:///new",
            "workspaceFolders":[{"uri":"file:///folder","name":"f"}]}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.get_root().as_deref(), Some("file:///new"));
    }

    #[test]
    fn test_root_falls_back_to_workspace_folder() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{
            "workspaceFolders":[{"uri":"file:///folder","name":"f"}]}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.get_root().as_deref(), Some("file:///folder"));
    }

    #[test]
    fn test_did_change_uri_and_version() {
        let json = r#"{"jsonrpc":"2.0","method":"textDocument/didChange","params":{
            "textDocument":{"uri":"file:///p/src/a.rs","version":7},"contentChanges":[]}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.get_uri().as_deref(), Some("file:///p/src/a.rs"));
        assert_eq!(req.get_version(), 7);
    }

    #[test]
    fn test_added_workspace_folder() {
        let json = r#"{"jsonrpc":"2.0","method":"workspace/didChangeWorkspaceFolders","params":{
            "event":{"added":[{"uri":"file:///other","name":"o"}],"removed":[]}}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.get_added_folder().as_deref(), Some("file:///other"));
    }

    #[test]
    fn test_outgoing_notification_has_no_id() {
        let note = JsonRpcRequest::notification("autoInspect/didInspect", serde_json::json!({}));
        let text = serde_json::to_string(&note).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(note.is_notification());
    }
}
