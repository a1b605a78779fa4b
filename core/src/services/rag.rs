use reqwest::Method;
use termgate_protocol::collab::RagQueryRequest;
use termgate_protocol::collab::RagQueryResponse;

use crate::resilience::ClientError;
use crate::resilience::ResilientClient;

pub const SERVICE_NAME: &str = "rag";

#[derive(Debug, Clone)]
pub struct RagClient {
    client: ResilientClient,
}

impl RagClient {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    pub async fn query(
        &self,
        request: &RagQueryRequest,
        token: Option<&str>,
    ) -> Result<RagQueryResponse, ClientError> {
        self.client
            .send_json(Method::POST, &["query"], request, token)
            .await
    }
}
