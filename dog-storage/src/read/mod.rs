//! Read path: per-range accumulation, resumable readers, object descriptors
//! and the token-sequenced [`ObjectReader`] handle.

mod descriptor;
mod range;
mod reader;
mod resumable;

pub use descriptor::{ObjectDescriptor, RangeReader};
pub use range::ReadRange;
pub use reader::ObjectReader;
pub use resumable::ResumableReader;
