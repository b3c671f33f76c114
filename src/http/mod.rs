//! HTTP client adapter: the one place outbound mutations pass through.

mod client;
pub(crate) mod transport;

pub use client::{HttpClient, HttpError};
pub use transport::{ReqwestTransport, Request, Response, Transport, TransportError};
