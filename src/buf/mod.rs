//! Buffer descriptors.
//!
//! - [`Buf`] a window of bytes in memory or in a file
//! - [`Flags`] content kind and control signals
//! - [`File`] and [`FileRegion`] file resident content
mod flags;
mod file;
mod buffer;

pub use flags::Flags;
pub use file::{File, FileRegion};
pub use buffer::{Buf, Tag};
