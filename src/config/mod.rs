//! Configuration: `start` options and the CLI config file

mod schema;
mod store;

pub use schema::{AppConfig, IceServer, IceUrls, LoopbackConfig, SessionConfig};
pub use store::ConfigStore;
