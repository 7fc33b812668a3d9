//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise.
mod buffer;
mod init;
mod rawcell;
pub use self::{buffer::*, init::*, rawcell::*};
