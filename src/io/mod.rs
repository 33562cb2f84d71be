//! Random-access file abstractions.
//!
//! The TIFF reader and the EXIF patch both work against these traits rather
//! than `std::fs::File`, so they can be exercised against in-memory buffers.

mod random_access;

pub use random_access::{RandomAccess, RandomRead};
