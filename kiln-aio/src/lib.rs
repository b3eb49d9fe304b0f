// kiln-aio/src/lib.rs
//! Blocking IO for kiln: checksums, archive extraction, filesystem helpers,
//! JSON files and external process execution.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod json_io;
pub mod process;

pub use checksum::{sha256_file, verify_checksum};
pub use extract::{extract_archive, infer_archive_root_dir};
pub use json_io::{read_json, write_json_atomic};
pub use process::{run_command, CommandOutput, CommandSpec};
