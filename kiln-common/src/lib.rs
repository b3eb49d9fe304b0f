// kiln-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod options;
pub mod pipeline;

// Re-export key types
pub use config::Config;
pub use error::{KilnError, Result};
pub use formulary::Formulary;
pub use keg::{InstalledPackageRecord, KegRegistry};
pub use model::Formula;
pub use options::{BuildConfiguration, OptionRequest, Toolchain};
