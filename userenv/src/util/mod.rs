//! Small host-level helpers.

mod process;

pub use process::{hostname, is_process_alive, send_signal};
