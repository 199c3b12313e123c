pub mod archives;
pub mod fixtures;
pub mod http_client;
pub mod server;

pub use archives::*;
pub use fixtures::*;
pub use http_client::*;
pub use server::*;
