//! Mapper contract: per-direction record translation.
//!
//! Each direction of a job carries a mapper pair `{to_dest, to_source}`,
//! ideally inverses of each other, although the engine does not verify
//! this. Mapper failures are per-record and non-fatal: the engine skips
//! the record and records the error in the run summary.

use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug)]
#[error("mapping failed: {0}")]
pub struct MapError(pub String);

/// Translates records between the two sides of one direction.
pub trait Mapper: Send + Sync {
    /// Map a source-side record into its destination-side shape.
    fn to_dest(&self, record: &Record) -> Result<Record, MapError>;

    /// Map a destination-side record back into its source-side shape.
    fn to_source(&self, record: &Record) -> Result<Record, MapError>;
}

/// Passes records through unchanged. Useful when both sides share a field
/// vocabulary, and as the default for dry runs.
pub struct IdentityMapper;

impl Mapper for IdentityMapper {
    fn to_dest(&self, record: &Record) -> Result<Record, MapError> {
        Ok(record.clone())
    }

    fn to_source(&self, record: &Record) -> Result<Record, MapError> {
        Ok(record.clone())
    }
}
