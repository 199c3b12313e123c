pub mod backoff;
pub mod feed;
pub mod orchestrator;
pub mod poller;
pub mod store;

pub use backoff::*;
pub use feed::*;
pub use orchestrator::*;
pub use poller::*;
pub use store::*;
