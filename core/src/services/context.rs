use reqwest::Method;
use termgate_protocol::collab::ContextDocument;
use termgate_protocol::collab::TerminalContext;

use crate::resilience::ClientError;
use crate::resilience::ResilientClient;

pub const SERVICE_NAME: &str = "context";

/// Client for the context-enrichment (MCP) service.
#[derive(Debug, Clone)]
pub struct ContextClient {
    client: ResilientClient,
}

impl ContextClient {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    pub async fn enriched_context(
        &self,
        session_id: &str,
        token: Option<&str>,
    ) -> Result<Option<TerminalContext>, ClientError> {
        self.client
            .get_optional_json(&["context", "sessions", session_id], token)
            .await
    }

    pub async fn store_document(
        &self,
        document: &ContextDocument,
        token: Option<&str>,
    ) -> Result<(), ClientError> {
        self.client
            .send(Method::POST, &["context", "documents"], document, token)
            .await
    }
}
