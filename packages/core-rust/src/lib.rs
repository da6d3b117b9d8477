//! `Stowage` Core: key normalization, structured values, the value codec,
//! and the shared error taxonomy.

pub mod clock;
pub mod codec;
pub mod error;
pub mod key;
pub mod meta;
pub mod value;

pub use clock::{ClockSource, LogicalClock, SystemClock, Timestamp};
pub use codec::CodecError;
pub use error::{StorageError, StorageResult};
pub use key::{normalize_base_key, normalize_key, KEY_SEPARATOR};
pub use meta::StorageMeta;
pub use value::Value;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
