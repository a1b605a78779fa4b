//! SSH-backed terminal sessions and the pumps that connect them to viewers.

mod bridge;
mod connection;
mod error;
mod line;
mod manager;
pub mod ssh;
mod transport;

pub use bridge::Termination;
pub use connection::Connection;
pub use connection::InputEvent;
pub use connection::NewConnection;
pub use error::SessionError;
pub use line::LineEdit;
pub use line::edit_line;
pub use manager::ManagerSettings;
pub use manager::SessionManager;
pub use manager::ViewerAttachment;
pub use ssh::RusshConnector;
pub use transport::ConnectParams;
pub use transport::Connected;
pub use transport::Credentials;
pub use transport::OsInfo;
pub use transport::PtyRequest;
pub use transport::SshConnector;
pub use transport::TerminalTransport;
pub use transport::TransportError;
pub use transport::TransportOutput;
