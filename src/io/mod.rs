//! I/O utilities for tproxy-tunnel
//!
//! Bidirectional copy used to relay established TCP tunnels.

mod copy;

pub use copy::{bidirectional_copy, bidirectional_copy_with_buffer, CopyResult, DEFAULT_BUFFER_SIZE};
