// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::Duration;

const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Retries a fallible operation a bounded number of times.
///
/// Used to hide transient decompression and I/O races behind block reads.
/// `until` inspects each failure; returning `true` stops retrying and
/// surfaces the error immediately (typically: the cache entry was
/// invalidated, or the segment was superseded). `resource_id` only serves
/// logging.
pub fn retry<T>(
    resource_id: &str,
    max_retry_limit: usize,
    until: impl Fn(&crate::Error) -> bool,
    mut op: impl FnMut() -> crate::Result<T>,
) -> crate::Result<T> {
    let mut attempt = 0;

    loop {
        match op() {
            Ok(item) => return Ok(item),
            Err(e) => {
                if until(&e) {
                    log::warn!("{resource_id}: giving up retries: {e:?}");
                    return Err(e);
                }

                if attempt >= max_retry_limit {
                    log::warn!("{resource_id}: retry limit {max_retry_limit} exhausted: {e:?}");
                    return Err(e);
                }

                attempt += 1;
                log::debug!("{resource_id}: retrying after failure ({attempt}/{max_retry_limit}): {e:?}");
                std::thread::sleep(BACKOFF_STEP * attempt as u32);
            }
        }
    }
}
