//! Utility
//!
//! **This module is exempt from the API stability guarantee** — it's exposed
//! only because port crates and macros need it.

pub(crate) mod ctz;
mod init;
mod prio_bitmap;

pub use self::{init::Init, prio_bitmap::FixedPrioBitmap};
