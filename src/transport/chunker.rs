use std::num::NonZeroUsize;

use crate::models::{Batch, Reading};

/// Splits `readings` into slices of exactly `chunk_size`, except possibly the
/// last. Lazy and order preserving.
pub fn chunk(readings: &[Reading], chunk_size: NonZeroUsize) -> std::slice::Chunks<'_, Reading> {
    readings.chunks(chunk_size.get())
}

/// Owned batches tagged with `session_key`, ready for a transport.
pub fn batches<'a>(
    session_key: &'a str,
    readings: &'a [Reading],
    chunk_size: NonZeroUsize,
) -> impl Iterator<Item = Batch> + 'a {
    chunk(readings, chunk_size).map(move |slice| Batch::new(session_key, slice.to_vec()))
}
