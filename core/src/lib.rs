//! Core of the terminal gateway: sessions, viewers, query mode and the
//! resilience layer around collaborator services.

pub mod caller;
pub mod config;
pub mod hub;
pub mod memory;
pub mod query_mode;
pub mod resilience;
pub mod services;
pub mod session;

pub use caller::Caller;
pub use config::ConfigError;
pub use config::GatewayConfig;
pub use hub::WebSocketHub;
pub use memory::MemorySafeguard;
pub use query_mode::QueryModeController;
pub use session::SessionError;
pub use session::SessionManager;
