//! Block-size policy for multipart uploads.

use crate::error::{BackendError, BackendResult};

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Provider hard cap on the number of parts in one multipart upload.
pub const MAX_PARTS: i64 = 10_000;

/// Recommend a block size for a file of the given size.
///
/// Tiers trade request count against retry cost; with the 150 MiB top tier
/// the largest supported single file is ~1.5 TB.
pub fn optimal_block_size(file_size: i64) -> i64 {
    if file_size <= 20 * MIB {
        10 * MIB
    } else if file_size <= 5 * GIB {
        30 * MIB
    } else if file_size <= 20 * GIB {
        50 * MIB
    } else {
        150 * MIB
    }
}

/// Check that a block size partitions the file into an allowed part count.
pub fn validate_block_size(block_size: i64, file_size: i64) -> BackendResult<()> {
    if block_size <= 0 {
        return Err(BackendError::InvalidBlockSize(
            "block size must be > 0".to_string(),
        ));
    }
    let parts = (file_size + block_size - 1) / block_size;
    if parts < 1 {
        return Err(BackendError::InvalidBlockSize(
            "file partitions into zero parts".to_string(),
        ));
    }
    if parts > MAX_PARTS {
        return Err(BackendError::InvalidBlockSize(format!(
            "{parts} parts exceeds the provider cap of {MAX_PARTS}"
        )));
    }
    Ok(())
}
