// kiln-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::{CachingFetcher, FetchRequest, Fetcher};
pub use validation::validate_url;
