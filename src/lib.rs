pub mod bridge;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod host;
pub mod logging;
pub mod platform;
pub mod resource;  // 번들 → 런타임 디렉토리 추출
pub mod router;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use connection::ConnectionState;
pub use console::{ConsoleLayer, ConsoleLines};
pub use error::BridgeError;
pub use host::HostBridge;
pub use platform::BackendTarget;
pub use resource::{DirectoryBundle, EmbeddedBundle, ResourceBundle};
pub use router::Envelope;
pub use supervisor::{state_machine::ProcessState, BackendStatus};
