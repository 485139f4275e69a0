use crate::models::ByteRange;

/// Split `[0, total_size)` into `chunk_count` consecutive ranges.
///
/// Every range has width `total_size / chunk_count` except the last, which
/// extends to `total_size` and absorbs the remainder. When the file is smaller
/// than `chunk_count` the width is one byte and fewer ranges are returned.
///
/// # Panics
///
/// Panics if `chunk_count` is 0.
pub fn plan(total_size: u64, chunk_count: usize) -> Vec<ByteRange> {
    assert!(chunk_count > 0, "chunk count must be greater than 0");

    if total_size == 0 {
        return Vec::new();
    }

    let count = chunk_count as u64;
    let width = (total_size / count).max(1);

    let mut ranges = Vec::with_capacity(count.min(total_size) as usize);
    let mut from = 0;
    for i in 0..count {
        if from >= total_size {
            break;
        }
        let to = if i == count - 1 { total_size } else { (from + width).min(total_size) };
        ranges.push(ByteRange::new(from, to));
        from = to;
    }
    ranges
}
