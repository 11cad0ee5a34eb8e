pub mod config;
pub mod driver;
pub mod error;
pub mod limiter;
pub mod pacer;
pub mod ramp;
pub mod reporter;
pub mod server;
pub mod stats;
pub mod transport;

pub use config::*;
pub use driver::*;
pub use error::*;
pub use limiter::*;
pub use pacer::*;
pub use ramp::*;
pub use reporter::*;
pub use server::*;
pub use stats::*;
pub use transport::*;
