pub mod artifacts;
pub mod budget;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod orchestrator;
pub mod prepare;
pub mod request;
pub mod session;
pub mod storage_paths;
pub mod throttle;

pub use artifacts::*;
pub use budget::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use executor::*;
pub use orchestrator::*;
pub use prepare::*;
pub use request::*;
pub use session::*;
pub use storage_paths::*;
pub use throttle::*;
