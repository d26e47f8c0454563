//! Upstream provider integration
//!
//! - [`mapper`] - per-provider payload shapes and adapter resolution
//! - [`adapter`] - wire encoding, call, response normalization
//! - [`transport`] - HTTP seam (reqwest, scripted mock)
//! - [`diagnosis`] - failure classification for API logs
//! - [`xml`] - XML codec shared with status polling

pub mod adapter;
pub mod diagnosis;
pub mod mapper;
pub mod transport;
pub mod xml;

pub use adapter::{AdapterConfig, ProviderFailure, StatusReport, SubmissionAdapter, SubmissionOutcome};
pub use mapper::{FieldMapper, MapperError, MapperKind, MapperRegistry, MapperRule, ProviderMapping};
#[cfg(any(test, feature = "mock-api"))]
pub use transport::mock::MockTransport;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody, TransportError};
