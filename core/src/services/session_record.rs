use reqwest::Method;
use termgate_protocol::collab::CommandRecord;
use termgate_protocol::collab::ModeRecord;
use termgate_protocol::collab::RecentArea;
use termgate_protocol::collab::SessionRecord;
use termgate_protocol::collab::SessionStatusRecord;
use termgate_protocol::collab::TerminalContext;

use crate::resilience::ClientError;
use crate::resilience::ResilientClient;

pub const SERVICE_NAME: &str = "session-record";

/// Typed client for the service that persists sessions, commands and
/// per-session terminal context.
#[derive(Debug, Clone)]
pub struct SessionRecordClient {
    client: ResilientClient,
}

impl SessionRecordClient {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    pub async fn create_session(
        &self,
        record: &SessionRecord,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::POST, &["sessions"], record, token)
            .await
    }

    pub async fn update_session_status(
        &self,
        session_id: &str,
        record: &SessionStatusRecord,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::PATCH, &["sessions", session_id], record, token)
            .await
    }

    pub async fn append_command(
        &self,
        session_id: &str,
        record: &CommandRecord,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::POST, &["sessions", session_id, "commands"], record, token)
            .await
    }

    pub async fn update_mode(
        &self,
        session_id: &str,
        record: &ModeRecord,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::PUT, &["sessions", session_id, "mode"], record, token)
            .await
    }

    pub async fn terminal_context(
        &self,
        session_id: &str,
        token: Option<&str>,
    ) -> Result<Option<TerminalContext>, ClientError> {
        self.client
            .get_optional_json(&["sessions", session_id, "context"], token)
            .await
    }

    /// Replaces the stored terminal context read back by query mode.
    pub async fn update_context(
        &self,
        session_id: &str,
        context: &TerminalContext,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::PUT, &["sessions", session_id, "context"], context, token)
            .await
    }

    /// Most recently used knowledge area, if the user has one.
    pub async fn recent_area(
        &self,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<Option<RecentArea>, ClientError> {
        self.client
            .get_optional_json(&["users", user_id, "recent-area"], token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::config::ServiceEndpoint;
    use crate::resilience::CircuitBreakerRegistry;
    use pretty_assertions::assert_eq;
    use termgate_protocol::TerminalMode;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn records(server: &MockServer) -> SessionRecordClient {
        let client = ResilientClient::new(
            SERVICE_NAME,
            &ServiceEndpoint {
                base_url: format!("{}/api/v1", server.uri()),
                timeout_ms: None,
            },
            reqwest::Client::new(),
            &CircuitBreakerRegistry::default(),
            &RetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..RetryConfig::default()
            },
        )
        .expect("client");
        SessionRecordClient::new(client)
    }

    #[tokio::test]
    async fn recent_area_absent_maps_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/recent-area"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let area = records(&server).recent_area("u1", None).await.expect("ok");
        assert_eq!(area, None);
    }

    #[tokio::test]
    async fn recent_area_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/recent-area"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"area_id": "a-9", "name": "Infra"})),
            )
            .mount(&server)
            .await;
        let area = records(&server).recent_area("u1", None).await.expect("ok");
        assert_eq!(
            area,
            Some(RecentArea {
                area_id: "a-9".to_string(),
                name: Some("Infra".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn ids_cannot_escape_their_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/admin/recent-area"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"area_id": "wrong"})),
            )
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/..%2Fadmin%3Fx/recent-area"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        let records = records(&server);

        let area = records.recent_area("../admin?x", None).await.expect("ok");
        assert_eq!(area, None);

        for id in ["..", ".", ""] {
            let err = records
                .recent_area(id, None)
                .await
                .expect_err("dot segments are rejected");
            assert!(matches!(err, ClientError::InvalidUrl { .. }), "{err}");
        }
        assert_eq!(server.received_requests().await.as_ref().map(Vec::len), Some(1));
        server.verify().await;
    }

    #[tokio::test]
    async fn context_update_targets_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/sessions/s%2F1/context"))
            .and(body_json(serde_json::json!({"recent_commands": ["ls", "df -h"]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        records(&server)
            .update_context(
                "s/1",
                &TerminalContext {
                    recent_commands: vec!["ls".to_string(), "df -h".to_string()],
                    ..TerminalContext::default()
                },
                None,
            )
            .await
            .expect("stored");
        server.verify().await;
    }

    #[tokio::test]
    async fn mode_update_sends_mode_and_area() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/sessions/s1/mode"))
            .and(body_json(serde_json::json!({"mode": "query", "area_id": "a-1"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        records(&server)
            .update_mode(
                "s1",
                &ModeRecord {
                    mode: TerminalMode::Query,
                    area_id: Some("a-1".to_string()),
                },
                None,
            )
            .await
            .expect("persisted");
        server.verify().await;
    }
}
