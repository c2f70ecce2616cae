//! Live streaming decoder: the consumer-side concurrency core (§4.10) plus
//! the file-discovery, filtering, and `TimeSpec` pieces the `live` CLI
//! surface (§6) is built from.

pub mod decoder;
pub mod ordered_buffer;
pub mod timespec;

pub use decoder::{decode_available, discover_tracebuffers, DecodedEntry, Filters};
pub use ordered_buffer::{Entry, OrderedBuffer};
pub use timespec::{parse_unsigned_duration_ns, TimeSpec};
