//! Architecture support.
//!
//! Everything CPU-specific lives under here; the rest of the kernel goes
//! through these interfaces and never touches registers directly.

pub mod x86;
