//! HTTP layer: request preparation, the transport seam and the retrying
//! send loop

pub mod client;
pub mod transport;

pub use client::{HttpClient, RequestParts, SendDisposition};
pub use transport::{
    HttpResponse, HttpTransport, PreparedRequest, RequestBody, ReqwestTransport, TransportConfig,
    TransportError, TransportErrorKind,
};
