pub mod action;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod manager;
pub mod node;
pub mod session;
pub mod sync;

// Re-export commonly used types
pub use config::{HubConfig, Timeouts};
pub use device::{Device, DeviceHandler, DeviceProperties};
pub use error::{ConfigError, HubError, Result};
pub use executor::{ActionExecutor, TestRunExecutor, TestRunReport};
pub use manager::DeviceManager;
pub use session::{Session, SessionManager};
pub use sync::ExtendedWaitGroup;
