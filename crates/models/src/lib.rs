pub mod config;
pub mod error;
pub mod manifest;
pub mod record;
pub mod release;
pub mod status;
pub mod version;

pub use config::*;
pub use error::*;
pub use manifest::*;
pub use record::*;
pub use release::*;
pub use status::*;
pub use version::*;
