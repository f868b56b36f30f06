//! The transfer abstraction used by assembly workers.
//!
//! A fetcher streams a resource directly into a caller-provided buffer
//! (in practice a mapped window of the output image), so component files
//! are never staged on disk. Progress is reported through a callback
//! carried by the call.

mod http;

pub use http::HttpFetcher;

use std::io;

/// Errors from fetching a resource.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The HTTP request could not be built or sent.
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The transfer averaged under the minimum throughput for too long.
    #[error("transfer from {url} stalled")]
    Stalled { url: String },

    /// The resource is larger than the destination buffer.
    #[error("{url} exceeds the expected {capacity} bytes")]
    Overflow { url: String, capacity: usize },

    /// Reading a `file://` resource or the response body failed.
    #[error("I/O error fetching {url}: {source}")]
    Io { url: String, source: io::Error },
}

/// Streams resources into caller-owned buffers.
///
/// Implementations must follow HTTP redirects, must not reallocate or
/// buffer beyond `dest`, and must invoke `on_progress` with a monotonically
/// increasing byte count. A short read is not an error at this level: the
/// byte count is returned and the caller decides.
pub trait Fetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &mut [u8],
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FetchError>;
}
