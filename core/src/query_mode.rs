//! Normal/query mode state machine.
//!
//! In query mode keystrokes are edited locally and submitted lines are sent
//! to the RAG service instead of the remote shell. Mode lives on the
//! [`Connection`]; persistence to the session-record service is best-effort.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use owo_colors::OwoColorize;
use regex_lite::Regex;
use termgate_protocol::ModeChangeRequest;
use termgate_protocol::ModeChanged;
use termgate_protocol::RagResponse;
use termgate_protocol::Suggestion;
use termgate_protocol::TerminalMode;
use termgate_protocol::WebSocketMessage;
use termgate_protocol::collab::ContextDocument;
use termgate_protocol::collab::ModeRecord;
use termgate_protocol::collab::RagQueryRequest;
use termgate_protocol::collab::RagQueryResponse;
use termgate_protocol::collab::TerminalContext;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::caller::Caller;
use crate::hub::ViewerId;
use crate::hub::WebSocketHub;
use crate::resilience::ClientError;
use crate::services::Collaborators;
use crate::services::ContextClient;
use crate::services::RagClient;
use crate::services::SessionRecordClient;
use crate::session::Connection;

const MAX_SUGGESTIONS: usize = 5;
const QUERY_PROMPT: &str = "? ";
const CLEAR_LINE: &str = "\r\x1b[2K";

const SHELL_LANGUAGES: &[&str] = &["", "bash", "sh", "shell", "zsh", "console"];

static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeOutcome {
    Enabled { area_id: String },
    Disabled,
    /// No area was known; the originating viewer was asked to pick one.
    AreaRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Ignored,
    Answered(RagQueryResponse),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct QueryModeController {
    hub: Arc<WebSocketHub>,
    records: SessionRecordClient,
    context: ContextClient,
    rag: RagClient,
}

impl QueryModeController {
    pub fn new(hub: Arc<WebSocketHub>, collaborators: &Collaborators) -> Self {
        Self {
            hub,
            records: collaborators.records.clone(),
            context: collaborators.context.clone(),
            rag: collaborators.rag.clone(),
        }
    }

    /// Flips the mode of `conn`. Mode changes on one connection are applied
    /// one at a time, so two quick shortcuts always enable then disable.
    pub async fn toggle(&self, conn: &Connection, origin: ViewerId, caller: &Caller) -> ModeOutcome {
        let _serial = conn.lock_mode_change().await;
        self.toggle_locked(conn, origin, caller).await
    }

    async fn toggle_locked(&self, conn: &Connection, origin: ViewerId, caller: &Caller) -> ModeOutcome {
        if conn.mode() == TerminalMode::Query {
            return self.disable(conn, origin, caller).await;
        }
        if let Some(area_id) = conn.area_id() {
            return self.enable(conn, origin, caller, area_id).await;
        }
        match self.records.recent_area(&caller.user_id, caller.token()).await {
            Ok(Some(area)) => self.enable(conn, origin, caller, area.area_id).await,
            Ok(None) => self.request_area(conn, origin).await,
            Err(err) => {
                warn!(session_id = conn.id(), "recent area lookup failed: {err}");
                self.request_area(conn, origin).await
            }
        }
    }

    /// Applies a `mode_change_request` sent by a viewer.
    pub async fn handle_request(
        &self,
        conn: &Connection,
        origin: ViewerId,
        caller: &Caller,
        request: ModeChangeRequest,
    ) -> ModeOutcome {
        let _serial = conn.lock_mode_change().await;
        match (request.mode, request.area_id) {
            (Some(TerminalMode::Normal), _) => self.disable(conn, origin, caller).await,
            (_, Some(area_id)) if !area_id.is_empty() => {
                self.enable(conn, origin, caller, area_id).await
            }
            (Some(TerminalMode::Query), _) if conn.mode() == TerminalMode::Query => {
                ModeOutcome::Enabled {
                    area_id: conn.area_id().unwrap_or_default(),
                }
            }
            _ => self.toggle_locked(conn, origin, caller).await,
        }
    }

    pub async fn enable(
        &self,
        conn: &Connection,
        origin: ViewerId,
        caller: &Caller,
        area_id: String,
    ) -> ModeOutcome {
        conn.set_mode(TerminalMode::Query, Some(area_id.clone()));
        info!(session_id = conn.id(), area_id, "query mode enabled");
        self.announce(conn, origin, TerminalMode::Query, Some(area_id.clone()))
            .await;
        self.hub
            .broadcast(conn.id(), &WebSocketMessage::output(enabled_banner(&area_id)))
            .await;
        self.persist(conn, caller, TerminalMode::Query, Some(area_id.clone()))
            .await;
        ModeOutcome::Enabled { area_id }
    }

    pub async fn disable(&self, conn: &Connection, origin: ViewerId, caller: &Caller) -> ModeOutcome {
        conn.set_mode(TerminalMode::Normal, None);
        let area_id = conn.area_id();
        info!(session_id = conn.id(), "query mode disabled");
        self.announce(conn, origin, TerminalMode::Normal, area_id.clone())
            .await;
        self.hub
            .broadcast(conn.id(), &WebSocketMessage::output(disabled_banner()))
            .await;
        self.persist(conn, caller, TerminalMode::Normal, area_id).await;
        ModeOutcome::Disabled
    }

    /// Edits the pending query line, echoes the edit to every viewer and
    /// returns the lines submitted with Enter.
    pub async fn handle_keystrokes(&self, conn: &Connection, data: &str) -> Vec<String> {
        let edit = conn.edit_query_line(data);
        let mut echo = edit.echo;
        // Submitted lines get a fresh prompt after their answer.
        if edit.interrupted || (echo.contains("\r\n") && edit.submitted.is_empty()) {
            echo.push_str(&prompt());
        }
        if !echo.is_empty() {
            self.hub
                .broadcast(conn.id(), &WebSocketMessage::output(echo))
                .await;
        }
        edit.submitted
    }

    pub async fn handle_query(
        &self,
        conn: &Connection,
        caller: &Caller,
        text: &str,
        area_id: Option<String>,
    ) -> QueryOutcome {
        let query = text.trim();
        if query.is_empty() {
            return QueryOutcome::Ignored;
        }
        let session_id = conn.id();
        self.hub
            .broadcast(session_id, &WebSocketMessage::output(processing_indicator()))
            .await;

        let terminal_context = self.gather_context(session_id, caller).await;
        let request = RagQueryRequest {
            query: query.to_string(),
            user_id: caller.user_id.clone(),
            area_id: area_id.clone(),
            terminal_context,
        };
        let response = match self.rag.query(&request, caller.token()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(session_id, "query failed: {err}");
                let message = failure_message(&err);
                self.hub
                    .broadcast(
                        session_id,
                        &WebSocketMessage::output(format!(
                            "{CLEAR_LINE}{}\r\n{}",
                            message.red(),
                            prompt()
                        )),
                    )
                    .await;
                return QueryOutcome::Failed(message);
            }
        };

        self.hub
            .broadcast(
                session_id,
                &WebSocketMessage::output(format!("{CLEAR_LINE}{}{}", render_answer(&response), prompt())),
            )
            .await;
        self.hub
            .broadcast(
                session_id,
                &WebSocketMessage::RagResponse(RagResponse {
                    query: query.to_string(),
                    answer: response.answer.clone(),
                    area_id: area_id.clone(),
                    sources: response.sources.clone(),
                }),
            )
            .await;

        let suggestions = extract_suggestions(&response.answer);
        conn.remember_suggestions(&suggestions);
        for suggestion in suggestions {
            self.hub
                .broadcast(session_id, &WebSocketMessage::SuggestionAvailable(suggestion))
                .await;
        }

        self.store_exchange(conn, caller, query, &response, area_id)
            .await;
        QueryOutcome::Answered(response)
    }

    async fn announce(
        &self,
        conn: &Connection,
        origin: ViewerId,
        mode: TerminalMode,
        area_id: Option<String>,
    ) {
        let message = WebSocketMessage::ModeChanged(ModeChanged { mode, area_id });
        self.hub.broadcast_except(conn.id(), origin, &message).await;
        self.hub.send_to(conn.id(), origin, &message).await;
    }

    async fn request_area(&self, conn: &Connection, origin: ViewerId) -> ModeOutcome {
        debug!(session_id = conn.id(), "no knowledge area known; asking viewer");
        let request = WebSocketMessage::ModeChangeRequest(ModeChangeRequest {
            mode: Some(TerminalMode::Query),
            area_id: None,
            message: Some("Select a knowledge area to enable query mode".to_string()),
        });
        self.hub.send_to(conn.id(), origin, &request).await;
        ModeOutcome::AreaRequested
    }

    async fn persist(
        &self,
        conn: &Connection,
        caller: &Caller,
        mode: TerminalMode,
        area_id: Option<String>,
    ) {
        let record = ModeRecord { mode, area_id };
        if let Err(err) = self
            .records
            .update_mode(conn.id(), &record, caller.token())
            .await
        {
            warn!(session_id = conn.id(), %mode, "mode changed locally only: {err}");
        }
    }

    async fn gather_context(&self, session_id: &str, caller: &Caller) -> TerminalContext {
        match self.records.terminal_context(session_id, caller.token()).await {
            Ok(Some(context)) if !context.is_empty() => return context,
            Ok(_) => {}
            Err(err) => debug!(session_id, "session context unavailable: {err}"),
        }
        match self.context.enriched_context(session_id, caller.token()).await {
            Ok(context) => context.unwrap_or_default(),
            Err(err) => {
                debug!(session_id, "enriched context unavailable: {err}");
                TerminalContext::default()
            }
        }
    }

    async fn store_exchange(
        &self,
        conn: &Connection,
        caller: &Caller,
        query: &str,
        response: &RagQueryResponse,
        area_id: Option<String>,
    ) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("kind".to_string(), "terminal_query".into());
        metadata.insert("asked_at".to_string(), Utc::now().to_rfc3339().into());
        metadata.insert("source_count".to_string(), response.sources.len().into());
        if let Some(area_id) = area_id {
            metadata.insert("area_id".to_string(), area_id.into());
        }
        let document = ContextDocument {
            session_id: conn.id().to_string(),
            user_id: caller.user_id.clone(),
            content: format!("Q: {query}\nA: {}", response.answer),
            metadata,
        };
        if let Err(err) = self.context.store_document(&document, caller.token()).await {
            debug!(session_id = conn.id(), "failed to store query context: {err}");
        }
    }
}

/// Turns fenced shell blocks in an answer into runnable suggestions.
pub fn extract_suggestions(answer: &str) -> Vec<Suggestion> {
    let Some(pattern) = FENCED_BLOCK.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(answer)
        .filter(|caps| {
            let language = caps.get(1).map_or("", |m| m.as_str());
            SHELL_LANGUAGES.contains(&language.to_ascii_lowercase().as_str())
        })
        .filter_map(|caps| caps.get(2))
        .flat_map(|block| block.as_str().lines())
        .map(|line| line.trim().trim_start_matches("$ ").trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .take(MAX_SUGGESTIONS)
        .map(|command| Suggestion {
            suggestion_id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            description: None,
        })
        .collect()
}

fn prompt() -> String {
    format!("{}", QUERY_PROMPT.magenta().bold())
}

fn enabled_banner(area_id: &str) -> String {
    format!(
        "\r\n{} {}\r\n{}\r\n{}",
        "[query mode]".cyan().bold(),
        format!("area {area_id}").dimmed(),
        "Ask a question and press Enter. Ctrl+Q returns to the shell.".dimmed(),
        prompt()
    )
}

fn disabled_banner() -> String {
    format!("\r\n{}\r\n", "[query mode off]".cyan().bold())
}

fn processing_indicator() -> String {
    format!("{}", "Searching knowledge base...".dimmed())
}

fn failure_message(err: &ClientError) -> String {
    if err.is_unavailable() {
        "Query service is temporarily unavailable".to_string()
    } else {
        format!("Query failed: {err}")
    }
}

fn render_answer(response: &RagQueryResponse) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\r\n", "Answer".green().bold()));
    for line in response.answer.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    if !response.sources.is_empty() {
        out.push_str(&format!("\r\n{}\r\n", "Sources".yellow().bold()));
        for (index, source) in response.sources.iter().enumerate() {
            let n = index + 1;
            match &source.url {
                Some(url) => out.push_str(&format!(
                    "  [{n}] {} {}\r\n",
                    source.title,
                    url.blue().underline()
                )),
                None => out.push_str(&format!("  [{n}] {}\r\n", source.title)),
            }
        }
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::config::ServiceEndpoint;
    use crate::config::ServicesConfig;
    use crate::config::WebSocketConfig;
    use crate::hub::ViewerFrame;
    use crate::hub::ViewerRegistration;
    use crate::resilience::ResilienceServices;
    use crate::session::NewConnection;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use termgate_protocol::SessionStatus;
    use termgate_protocol::collab::Source;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    struct Fixture {
        controller: QueryModeController,
        hub: Arc<WebSocketHub>,
        conn: Arc<Connection>,
        caller: Caller,
    }

    fn fixture(server: &MockServer) -> Fixture {
        let endpoint = ServiceEndpoint {
            base_url: server.uri(),
            timeout_ms: None,
        };
        let services = ServicesConfig {
            session_record: endpoint.clone(),
            context: endpoint.clone(),
            rag: endpoint,
        };
        let resilience = ResilienceServices::new(
            &Default::default(),
            &RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                attempt_timeout_ms: 2_000,
            },
        );
        let collaborators = Collaborators::new(&resilience, &services).expect("clients");
        let hub = Arc::new(WebSocketHub::new(&WebSocketConfig::default()));
        let conn = Connection::new(NewConnection {
            id: "s1".to_string(),
            owner: Caller::new("u1"),
            client_ip: "127.0.0.1".to_string(),
            host: "box".to_string(),
            port: 22,
            username: "ops".to_string(),
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            keepalive_interval: Duration::from_secs(30),
            max_buffer_size: 1024,
        });
        conn.transition(SessionStatus::Connected);
        Fixture {
            controller: QueryModeController::new(Arc::clone(&hub), &collaborators),
            hub,
            conn,
            caller: Caller::new("u1").with_token("tok"),
        }
    }

    fn drain(viewer: &mut ViewerRegistration) -> Vec<WebSocketMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = viewer.frames.try_recv() {
            if let ViewerFrame::Text(text) = frame {
                out.push(WebSocketMessage::decode(&text).expect("frame"));
            }
        }
        out
    }

    fn count(messages: &[WebSocketMessage], kind: &str) -> usize {
        messages.iter().filter(|m| m.kind() == kind).count()
    }

    async fn mount_mode_sink(server: &MockServer) {
        Mock::given(method("PUT"))
            .and(path("/sessions/s1/mode"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn toggle_without_area_requests_one_and_preserves_it_afterwards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1/recent-area"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        mount_mode_sink(&server).await;
        let f = fixture(&server);
        let mut origin = f.hub.register("s1");

        let outcome = f.controller.toggle(&f.conn, origin.id, &f.caller).await;
        assert_eq!(outcome, ModeOutcome::AreaRequested);
        assert_eq!(f.conn.mode(), TerminalMode::Normal);
        let frames = drain(&mut origin);
        assert_eq!(count(&frames, "mode_change_request"), 1);
        assert_eq!(count(&frames, "mode_changed"), 0);

        let outcome = f
            .controller
            .handle_request(
                &f.conn,
                origin.id,
                &f.caller,
                ModeChangeRequest {
                    mode: Some(TerminalMode::Query),
                    area_id: Some("area-1".to_string()),
                    message: None,
                },
            )
            .await;
        assert_eq!(
            outcome,
            ModeOutcome::Enabled {
                area_id: "area-1".to_string()
            }
        );
        assert_eq!(f.conn.mode(), TerminalMode::Query);

        assert_eq!(
            f.controller.toggle(&f.conn, origin.id, &f.caller).await,
            ModeOutcome::Disabled
        );
        assert_eq!(f.conn.area_id(), Some("area-1".to_string()));

        // The preserved area is reused without another lookup.
        assert_eq!(
            f.controller.toggle(&f.conn, origin.id, &f.caller).await,
            ModeOutcome::Enabled {
                area_id: "area-1".to_string()
            }
        );
        server.verify().await;
    }

    #[tokio::test]
    async fn toggle_uses_recent_area_and_notifies_other_viewers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1/recent-area"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"area_id": "ops"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/sessions/s1/mode"))
            .and(body_partial_json(serde_json::json!({"mode": "query", "area_id": "ops"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server);
        let mut origin = f.hub.register("s1");
        let mut observer = f.hub.register("s1");

        let outcome = f.controller.toggle(&f.conn, origin.id, &f.caller).await;
        assert_eq!(
            outcome,
            ModeOutcome::Enabled {
                area_id: "ops".to_string()
            }
        );
        let changed = WebSocketMessage::ModeChanged(ModeChanged {
            mode: TerminalMode::Query,
            area_id: Some("ops".to_string()),
        });
        assert_eq!(drain(&mut observer)[0], changed);
        assert_eq!(drain(&mut origin)[0], changed);
        server.verify().await;
    }

    #[tokio::test]
    async fn overlapping_toggles_apply_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1/recent-area"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"area_id": "ops"}))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        mount_mode_sink(&server).await;
        let f = fixture(&server);
        let origin = f.hub.register("s1");

        // Both shortcuts arrive while the area lookup is still in flight.
        let (first, second) = tokio::join!(
            f.controller.toggle(&f.conn, origin.id, &f.caller),
            f.controller.toggle(&f.conn, origin.id, &f.caller),
        );
        assert_eq!(
            first,
            ModeOutcome::Enabled {
                area_id: "ops".to_string()
            }
        );
        assert_eq!(second, ModeOutcome::Disabled);
        assert_eq!(f.conn.mode(), TerminalMode::Normal);
        assert_eq!(f.conn.area_id(), Some("ops".to_string()));
        server.verify().await;
    }

    #[tokio::test]
    async fn failed_persistence_keeps_local_mode() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/sessions/s1/mode"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let f = fixture(&server);
        let origin = f.hub.register("s1");
        let outcome = f
            .controller
            .enable(&f.conn, origin.id, &f.caller, "area-2".to_string())
            .await;
        assert_eq!(
            outcome,
            ModeOutcome::Enabled {
                area_id: "area-2".to_string()
            }
        );
        assert_eq!(f.conn.mode(), TerminalMode::Query);
    }

    #[tokio::test]
    async fn query_falls_back_to_enriched_context_and_emits_answer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/s1/context"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/context/sessions/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "recent_commands": ["kubectl get pods"],
                "working_directory": "/srv"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_partial_json(serde_json::json!({
                "query": "why is the pod pending",
                "user_id": "u1",
                "area_id": "k8s",
                "terminal_context": {"working_directory": "/srv"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "answer": "Check events:\n```bash\nkubectl describe pod web-0\n```",
                "sources": [{"title": "Runbook", "url": "https://wiki/runbook"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/context/documents"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server);
        let mut viewer = f.hub.register("s1");

        let outcome = f
            .controller
            .handle_query(&f.conn, &f.caller, "  why is the pod pending ", Some("k8s".to_string()))
            .await;
        let QueryOutcome::Answered(response) = outcome else {
            panic!("expected an answer, got {outcome:?}");
        };
        assert_eq!(
            response.sources,
            vec![Source {
                title: "Runbook".to_string(),
                url: Some("https://wiki/runbook".to_string()),
                document_id: None,
                snippet: None,
            }]
        );

        let frames = drain(&mut viewer);
        assert_eq!(count(&frames, "rag_response"), 1);
        let suggestion = frames
            .iter()
            .find_map(|m| match m {
                WebSocketMessage::SuggestionAvailable(s) => Some(s.clone()),
                _ => None,
            })
            .expect("suggestion");
        assert_eq!(suggestion.command, "kubectl describe pod web-0");
        assert_eq!(
            f.conn.suggestion(&suggestion.suggestion_id),
            Some("kubectl describe pod web-0".to_string())
        );
        server.verify().await;
    }

    #[tokio::test]
    async fn query_failure_is_reported_inline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string("no area"))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server);
        f.conn
            .set_mode(TerminalMode::Query, Some("area".to_string()));
        let mut viewer = f.hub.register("s1");

        let outcome = f
            .controller
            .handle_query(&f.conn, &f.caller, "hello", None)
            .await;
        assert!(matches!(outcome, QueryOutcome::Failed(ref msg) if msg.contains("400")));
        assert_eq!(f.conn.mode(), TerminalMode::Query);
        let frames = drain(&mut viewer);
        assert_eq!(count(&frames, "rag_response"), 0);
        assert!(count(&frames, "terminal_output") >= 2);
        server.verify().await;
    }

    #[tokio::test]
    async fn blank_query_is_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let f = fixture(&server);
        let mut viewer = f.hub.register("s1");
        let outcome = f.controller.handle_query(&f.conn, &f.caller, "   ", None).await;
        assert_eq!(outcome, QueryOutcome::Ignored);
        assert!(drain(&mut viewer).is_empty());
        server.verify().await;
    }

    #[tokio::test]
    async fn keystrokes_are_echoed_and_submitted_on_enter() {
        let server = MockServer::start().await;
        let f = fixture(&server);
        let mut viewer = f.hub.register("s1");
        assert!(f.controller.handle_keystrokes(&f.conn, "disk").await.is_empty());
        let submitted = f.controller.handle_keystrokes(&f.conn, " usage\r").await;
        assert_eq!(submitted, vec!["disk usage".to_string()]);
        let echoed: String = drain(&mut viewer)
            .into_iter()
            .filter_map(|m| match m {
                WebSocketMessage::TerminalOutput(out) => Some(out.data),
                _ => None,
            })
            .collect();
        assert_eq!(echoed, "disk usage\r\n");
    }

    #[test]
    fn suggestions_come_from_shell_blocks_only() {
        let answer = "Try:\n```sh\n$ df -h\n# comment\n\ndu -sh /var\n```\nand\n```python\nprint(1)\n```";
        let commands: Vec<String> = extract_suggestions(answer)
            .into_iter()
            .map(|s| s.command)
            .collect();
        assert_eq!(commands, vec!["df -h".to_string(), "du -sh /var".to_string()]);
    }
}
