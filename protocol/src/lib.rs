//! Wire types shared by the terminal gateway and its browser clients.
//!
//! Three families live here: the WebSocket envelope exchanged with viewers,
//! the REST request/response bodies of the gateway, and the payloads sent to
//! the collaborating services (session records, context, RAG).

pub mod collab;
pub mod message;
pub mod session;

pub use message::ControlAction;
pub use message::DecodeError;
pub use message::ExecuteSuggestion;
pub use message::ModeChangeRequest;
pub use message::ModeChanged;
pub use message::RagResponse;
pub use message::Resize;
pub use message::SessionControl;
pub use message::SessionStatusUpdate;
pub use message::Suggestion;
pub use message::TerminalInput;
pub use message::TerminalOutput;
pub use message::WebSocketMessage;
pub use session::CreateSessionRequest;
pub use session::ListSessionsQuery;
pub use session::SessionStatus;
pub use session::SessionView;
pub use session::TerminalMode;
pub use session::UpdateSessionRequest;
