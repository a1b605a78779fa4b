//! Typed clients for the collaborating services.

mod context;
mod rag;
mod session_record;

pub use context::ContextClient;
pub use rag::RagClient;
pub use session_record::SessionRecordClient;

use crate::config::ServicesConfig;
use crate::resilience::ClientError;
use crate::resilience::ResilienceServices;

#[derive(Debug, Clone)]
pub struct Collaborators {
    pub records: SessionRecordClient,
    pub context: ContextClient,
    pub rag: RagClient,
}

impl Collaborators {
    pub fn new(
        resilience: &ResilienceServices,
        config: &ServicesConfig,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            records: SessionRecordClient::new(
                resilience.client(session_record::SERVICE_NAME, &config.session_record)?,
            ),
            context: ContextClient::new(
                resilience.client(context::SERVICE_NAME, &config.context)?,
            ),
            rag: RagClient::new(resilience.client(rag::SERVICE_NAME, &config.rag)?),
        })
    }
}
