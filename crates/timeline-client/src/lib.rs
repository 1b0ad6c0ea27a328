pub mod error;
pub mod manager;
pub mod multiplexer;
pub mod settings;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{ClientError, SettingsError};
pub use manager::{ConnectArgs, ConnectionManager, ConnectionPhase, ManagerConfig, StatusObserver};
pub use multiplexer::{ManagerFactory, SessionMultiplexer};
pub use settings::{load_settings, load_settings_from_path, ClientSettings};
pub use transport::{
    Endpoints, HttpSnapshotFetcher, SnapshotFetcher, StreamCommand, StreamConnector, StreamHandle, StreamSignal,
    WsConnector,
};
