//! Types shared between the userenv library and its binaries.

pub mod errors;

pub use errors::{UserEnvError, UserEnvResult};
