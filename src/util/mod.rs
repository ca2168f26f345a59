pub mod env;
pub mod telemetry;

use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;

/// Compares two `&str`s without short-circuiting on the first differing byte, so response timing
/// does not leak how much of a token matched.
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let diff = a
        .bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (l, r)| acc | std::hint::black_box(l ^ r));

    diff == 0
}

/// Runs a fallible store future under `limit`, folding an elapsed deadline into the caller's error
/// type.
pub async fn with_deadline<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Elapsed>,
{
    tokio::time::timeout(limit, fut).await?
}
