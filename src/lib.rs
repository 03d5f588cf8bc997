pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod headers;
pub mod logging;
pub mod prebuffered;
pub mod response;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::{Config, TeardownPolicy};
pub use error::ProxyError;
pub use server::ProxyServer;
