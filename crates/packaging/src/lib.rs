pub mod extractor;
pub mod fetcher;
pub mod installer;
pub mod verifier;

pub use extractor::*;
pub use fetcher::*;
pub use installer::*;
pub use verifier::*;
