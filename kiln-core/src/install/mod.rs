// kiln-core/src/install/mod.rs
pub mod bottle;
pub mod installer;
pub mod link;

pub use installer::{install_keg, InstallOutcome, InstallRequest};
