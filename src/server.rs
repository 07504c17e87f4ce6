//! Inspection server - reads editor events on stdin, feeds the watcher, and
//! reports analysis runs back on stdout

use crate::check::{CommandCheck, NoCheck, ValidityCheck};
use crate::coalescer::{Batch, CompletionState};
use crate::config::Config;
use crate::controller::{SessionConfig, WatcherController};
use crate::engine::CommandEngine;
use crate::error::{InspectError, ERROR_INTERNAL_ERROR, ERROR_METHOD_NOT_FOUND, ERROR_PARSE_ERROR};
use crate::filter::{EditorFilter, OpenDocuments};
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::scope::InspectionProfile;
use crate::source::{DocumentEvent, DocumentHub};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Editor-facing server owning the watcher controller
pub struct InspectServer {
    config: Config,
    hub: DocumentHub,
    open_documents: OpenDocuments,
    completion: CompletionState,
    controller: WatcherController<CommandEngine>,
    /// Server capabilities to report
    server_capabilities: serde_json::Value,
    /// Whether we're shutting down
    shutting_down: bool,
}

impl InspectServer {
    /// Build the server from a fully merged config
    pub fn new(config: Config) -> Result<Self, InspectError> {
        config.validate()?;

        let analyzer = config
            .analyzer
            .clone()
            .ok_or_else(|| InspectError::ConfigError("Analyzer not configured".to_string()))?;
        let engine = CommandEngine::new(analyzer, config.analyzer_args.clone());

        let check: Arc<dyn ValidityCheck> = match config.check.clone() {
            Some(program) => {
                info!("Syntax check enabled: {}", program.display());
                Arc::new(CommandCheck::new(program, config.check_args.clone()))
            }
            None => Arc::new(NoCheck),
        };

        let hub = DocumentHub::new();
        let completion = CompletionState::default();
        let controller =
            WatcherController::new(engine, hub.clone(), check, Arc::new(completion.clone()));

        let server_capabilities = serde_json::json!({
            "capabilities": {
                "textDocumentSync": 1
            },
            "serverInfo": {
                "name": "auto-inspect",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        Ok(Self {
            config,
            hub,
            open_documents: OpenDocuments::default(),
            completion,
            controller,
            server_capabilities,
            shutting_down: false,
        })
    }

    /// Main run loop - read editor messages from stdin, run inspections as
    /// batches are accepted, write results to stdout
    pub async fn run(&mut self) -> Result<(), InspectError> {
        let reader = BufReader::new(tokio::io::stdin());
        self.serve(reader, tokio::io::stdout()).await
    }

    /// Serve one editor connection until EOF or `exit`
    async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> Result<(), InspectError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut messages = Self::spawn_reader(reader);

        info!("Inspection server started, waiting for editor messages on stdin");

        loop {
            tokio::select! {
                incoming = messages.recv() => {
                    match incoming {
                        None => {
                            info!("Stdin closed (EOF), shutting down");
                            break;
                        }
                        Some(Ok(msg)) => {
                            let trimmed = msg.trim();
                            if trimmed.is_empty() {
                                continue;
                            }

                            debug!("Received from editor: {}", trimmed);

                            match self.handle_message(trimmed).await {
                                Ok(Some(response)) => {
                                    Self::write_message(&mut writer, &response).await?;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!("Error handling message: {}", e);
                                }
                            }

                            if self.shutting_down {
                                info!("Exit requested, shutting down");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error reading stdin: {}", e);
                            break;
                        }
                    }
                }

                batch = self.controller.next_batch() => {
                    if let Some(notification) = self.run_batch(batch).await {
                        Self::write_message(&mut writer, &notification).await?;
                    }
                }
            }
        }

        self.controller.stop();
        info!("Inspection server exiting");
        Ok(())
    }

    /// Read framed messages on a task of their own so a half-received message
    /// survives the run loop switching to an accepted batch
    fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<Result<String, InspectError>>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut msg = String::new();
            loop {
                match Self::read_next_message(&mut reader, &mut msg).await {
                    Ok(Some(())) => {
                        if tx.send(Ok(std::mem::take(&mut msg))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            debug!("Editor input reader finished");
        });

        rx
    }

    /// Handle a single JSON-RPC message
    async fn handle_message(&mut self, message: &str) -> Result<Option<JsonRpcResponse>, InspectError> {
        // Strip BOM and other invisible characters
        let message = message.trim_start_matches('\u{feff}').trim();

        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                warn!("Failed to parse JSON-RPC message: {}", e);
                return Ok(Some(JsonRpcResponse::error(
                    None,
                    JsonRpcError::new(ERROR_PARSE_ERROR, format!("Parse error: {}", e)),
                )));
            }
        };

        debug!("Handling {} (id: {:?})", request.method, request.id);

        if request.is_initialize() {
            return Ok(Some(self.handle_initialize(&request)));
        }

        if request.is_shutdown() {
            info!("Handling shutdown request");
            if let Some(coalescer) = self.controller.coalescer() {
                info!(
                    "Stopping watcher at generation {} with {} pending changes",
                    coalescer.generation(),
                    coalescer.pending_changes().len()
                );
            }
            self.controller.stop();
            return Ok(Some(JsonRpcResponse::success(
                request.id.clone(),
                serde_json::Value::Null,
            )));
        }

        if request.is_exit() {
            self.shutting_down = true;
            return Ok(None);
        }

        if request.is_notification() {
            self.handle_notification(&request);
            return Ok(None);
        }

        Ok(Some(JsonRpcResponse::error(
            request.id.clone(),
            JsonRpcError::new(
                ERROR_METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            ),
        )))
    }

    fn handle_initialize(&mut self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let root = request
            .get_root()
            .and_then(|uri| Self::uri_to_path(&uri))
            .or_else(|| self.config.root.clone())
            .or_else(|| std::env::current_dir().ok());

        match root {
            Some(root) => {
                self.start_session(root);
                JsonRpcResponse::success(request.id.clone(), self.server_capabilities.clone())
            }
            None => JsonRpcResponse::error(
                request.id.clone(),
                JsonRpcError::new(ERROR_INTERNAL_ERROR, "No workspace root available"),
            ),
        }
    }

    fn handle_notification(&mut self, request: &JsonRpcRequest) {
        let path = request.get_uri().and_then(|uri| Self::uri_to_path(&uri));

        match (request.method.as_str(), path) {
            ("textDocument/didOpen", Some(path)) => self.open_documents.open(path),
            ("textDocument/didClose", Some(path)) => self.open_documents.close(&path),
            ("textDocument/didChange", Some(path)) => self.hub.publish(DocumentEvent::Changed {
                path,
                version: request.get_version(),
            }),
            ("workspace/willSaveAll", _) => self.hub.publish(DocumentEvent::SaveAllStarted),
            ("workspace/didSaveAll", _) => self.hub.publish(DocumentEvent::SaveAllFinished),
            ("autoInspect/completionShown", _) => self.completion.set_active(true),
            ("autoInspect/completionHidden", _) => {
                self.completion.set_active(false);
                self.hub.publish(DocumentEvent::CompletionDismissed);
            }
            ("workspace/didChangeWorkspaceFolders", _) => {
                match request.get_added_folder().and_then(|uri| Self::uri_to_path(&uri)) {
                    Some(root) => self.start_session(root),
                    None => debug!("Workspace folders changed without an added folder"),
                }
            }
            (method, _) => debug!("Ignoring notification: {}", method),
        }
    }

    /// (Re)start the watcher on `root`
    fn start_session(&mut self, root: PathBuf) {
        let filter = EditorFilter::new(
            root.clone(),
            self.open_documents.clone(),
            self.config.scratch_dirs.clone(),
            self.config.git_filter_enabled(),
        );

        self.controller.start(SessionConfig {
            root,
            delay: self.config.delay(),
            profile: InspectionProfile {
                name: self.config.profile.clone(),
            },
            filter: Arc::new(filter),
        });
    }

    /// Run the analyzer for an accepted batch; returns the report notification
    async fn run_batch(&mut self, batch: Batch) -> Option<JsonRpcRequest> {
        let generation = batch.generation;

        match self.controller.on_batch_accepted(batch).await {
            Ok(Some(report)) => Some(JsonRpcRequest::notification(
                "autoInspect/didInspect",
                serde_json::json!({
                    "generation": generation,
                    "files": report.files,
                    "success": report.success,
                    "output": report.output,
                }),
            )),
            Ok(None) => None,
            Err(e) => {
                error!("Inspection run failed: {}", e);
                None
            }
        }
    }

    async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), InspectError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let json = serde_json::to_string(message)?;
        debug!("Sending to editor: {}", json);
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_next_message<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        out: &mut String,
    ) -> Result<Option<()>, InspectError> {
        out.clear();

        let mut first_line = String::new();

        loop {
            first_line.clear();
            let n = reader.read_line(&mut first_line).await?;
            if n == 0 {
                return Ok(None);
            }

            let line = first_line.trim_end_matches(&['\r', '\n'][..]);
            if line.is_empty() {
                continue;
            }

            if line.to_ascii_lowercase().starts_with("content-length:") {
                let len_str = line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
                let content_length: usize = len_str.parse().map_err(|e| {
                    InspectError::JsonRpcParseError(format!("Invalid Content-Length header: {}", e))
                })?;

                // Read remaining headers until blank line
                loop {
                    let mut header_line = String::new();
                    let hn = reader.read_line(&mut header_line).await?;
                    if hn == 0 {
                        return Ok(None);
                    }
                    if header_line == "\n" || header_line == "\r\n" {
                        break;
                    }
                }

                let mut buf = vec![0u8; content_length];
                reader.read_exact(&mut buf).await?;
                *out = String::from_utf8_lossy(&buf).to_string();
                return Ok(Some(()));
            }

            out.push_str(line);
            return Ok(Some(()));
        }
    }

    /// Convert file URI to path (with URL decoding for special characters)
    fn uri_to_path(uri: &str) -> Option<PathBuf> {
        let decoded_uri = percent_decode_str(uri).decode_utf8().ok()?;
        let uri = decoded_uri.as_ref();

        if let Some(rest) = uri.strip_prefix("file:///") {
            #[cfg(windows)]
            {
                // file:///C:/path -> C:\path
                Some(PathBuf::from(rest.replace('/', "\\")))
            }
            #[cfg(not(windows))]
            {
                // file:///path -> /path
                Some(PathBuf::from(format!("/{}", rest)))
            }
        } else if let Some(rest) = uri.strip_prefix("file://") {
            Some(PathBuf::from(rest))
        } else {
            // Assume it's already a path
            Some(PathBuf::from(uri))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    fn server() -> InspectServer {
        let config = Config::parse_from([
            "auto-inspect",
            "--analyzer",
            "true",
            "--git-filter",
            "false",
            "--debounce-ms",
            "100",
        ]);
        InspectServer::new(config).unwrap()
    }

    fn file_uri(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    async fn send(server: &mut InspectServer, message: serde_json::Value) -> Option<JsonRpcResponse> {
        server.handle_message(&message.to_string()).await.unwrap()
    }

    fn framed(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, message: serde_json::Value) {
        writer
            .write_all(framed(&message.to_string()).as_bytes())
            .await
            .unwrap();
    }

    async fn next_json<R: AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> serde_json::Value {
        let line = timeout(Duration::from_secs(10), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[cfg(not(windows))]
    #[test]
    fn test_uri_to_path() {
        assert_eq!(
            InspectServer::uri_to_path("file:///home/u/my%20project/a.rs"),
            Some(PathBuf::from("/home/u/my project/a.rs"))
        );
        assert_eq!(
            InspectServer::uri_to_path("/plain/path.rs"),
            Some(PathBuf::from("/plain/path.rs"))
        );
    }

    #[tokio::test]
    async fn test_read_content_length_framed_message() {
        let body = r#"{"jsonrpc":"2.0","method":"exit"}"#;
        let message = framed(body);
        let mut reader = BufReader::new(message.as_bytes());
        let mut out = String::new();

        let read = InspectServer::read_next_message(&mut reader, &mut out).await.unwrap();
        assert_eq!(read, Some(()));
        assert_eq!(out, body);
        assert_eq!(
            InspectServer::read_next_message(&mut reader, &mut out).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_reader_keeps_half_received_message() {
        let (mut client, server_io) = tokio::io::duplex(1024);
        let mut messages = InspectServer::spawn_reader(BufReader::new(server_io));

        let body = serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didChange",
            "params": {"textDocument": {"uri": "file:///p/a.rs", "version": 3}}})
        .to_string();
        let message = framed(&body);
        let split = message.find("\r\n\r\n").unwrap() + 4 + 20;
        let (head, tail) = message.split_at(split);

        client.write_all(head.as_bytes()).await.unwrap();
        tokio::select! {
            _ = messages.recv() => panic!("message delivered before it was complete"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        client.write_all(tail.as_bytes()).await.unwrap();
        let received = timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, body);

        drop(client);
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_serve_reports_inspection_while_message_in_transit() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("a.rs");
        std::fs::write(&file, "").unwrap();

        let mut server = server();
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        let editor = async move {
            write_framed(
                &mut client_write,
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                    "params": {"rootUri": file_uri(root.path())}}),
            )
            .await;
            let response = next_json(&mut lines).await;
            assert_eq!(response["id"], 1);
            assert!(response.get("error").is_none());

            write_framed(
                &mut client_write,
                serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didOpen",
                    "params": {"textDocument": {"uri": file_uri(&file), "version": 1, "text": ""}}}),
            )
            .await;
            write_framed(
                &mut client_write,
                serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didChange",
                    "params": {"textDocument": {"uri": file_uri(&file), "version": 2}}}),
            )
            .await;

            // Shutdown request arrives in two pieces around the inspection
            let shutdown =
                framed(&serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown"}).to_string());
            let (head, tail) = shutdown.split_at(shutdown.len() - 10);
            client_write.write_all(head.as_bytes()).await.unwrap();

            let notification = next_json(&mut lines).await;
            assert_eq!(notification["method"], "autoInspect/didInspect");
            assert_eq!(notification["params"]["generation"], 1);
            assert_eq!(notification["params"]["files"], 1);
            assert_eq!(notification["params"]["success"], true);

            client_write.write_all(tail.as_bytes()).await.unwrap();
            let response = next_json(&mut lines).await;
            assert_eq!(response["id"], 2);
            assert!(response.get("error").is_none());

            write_framed(
                &mut client_write,
                serde_json::json!({"jsonrpc": "2.0", "method": "exit"}),
            )
            .await;
            root
        };

        let (served, _root) = timeout(Duration::from_secs(30), async {
            tokio::join!(
                server.serve(BufReader::new(server_read), server_write),
                editor
            )
        })
        .await
        .unwrap();
        served.unwrap();
        assert!(!server.controller.is_running());
    }

    #[tokio::test]
    async fn test_parse_error_and_unknown_method() {
        let mut server = server();

        let response = server.handle_message("{not json").await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().code, ERROR_PARSE_ERROR);

        let response = send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "textDocument/hover"}),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, ERROR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_initialize_starts_session_on_root() {
        let root = tempfile::tempdir().unwrap();
        let mut server = server();

        let response = send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"rootUri": file_uri(root.path())}}),
        )
        .await
        .unwrap();

        assert!(response.error.is_none());
        assert!(server.controller.is_running());
        assert_eq!(server.controller.root(), Some(root.path()));

        let response = send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown"}),
        )
        .await
        .unwrap();
        assert!(response.error.is_none());
        assert!(!server.controller.is_running());

        assert!(send(&mut server, serde_json::json!({"jsonrpc": "2.0", "method": "exit"}))
            .await
            .is_none());
        assert!(server.shutting_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_open_documents_are_batched() {
        let root = tempfile::tempdir().unwrap();
        let opened = root.path().join("open.rs");
        let closed = root.path().join("closed.rs");
        std::fs::write(&opened, "").unwrap();
        std::fs::write(&closed, "").unwrap();

        let mut server = server();
        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"rootUri": file_uri(root.path())}}),
        )
        .await;
        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didOpen",
                "params": {"textDocument": {"uri": file_uri(&opened), "version": 1, "text": ""}}}),
        )
        .await;
        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didChange",
                "params": {"textDocument": {"uri": file_uri(&closed), "version": 2}}}),
        )
        .await;
        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didChange",
                "params": {"textDocument": {"uri": file_uri(&opened), "version": 2}}}),
        )
        .await;

        let batch = timeout(Duration::from_secs(5), server.controller.next_batch())
            .await
            .unwrap();
        assert_eq!(batch.generation, 1);
        assert_eq!(batch.changes.len(), 1);
        assert!(batch.changes.contains(&opened));
    }

    #[tokio::test]
    async fn test_workspace_folder_change_restarts_session() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let mut server = server();

        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"rootUri": file_uri(first.path())}}),
        )
        .await;
        send(
            &mut server,
            serde_json::json!({"jsonrpc": "2.0", "method": "workspace/didChangeWorkspaceFolders",
                "params": {"event": {"added": [{"uri": file_uri(second.path()), "name": "b"}], "removed": []}}}),
        )
        .await;

        assert_eq!(server.controller.root(), Some(second.path()));
        assert_eq!(server.hub.subscriber_count(), 1);
    }
}
