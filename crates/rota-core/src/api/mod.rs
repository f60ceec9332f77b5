//! REST API access for the membership service.
//!
//! This module provides the `Gateway` every form and listing uses to reach the
//! API, the `Transport` seam underneath it, and `ApiError`.
//!
//! The API uses JWT bearer authentication; credentials are obtained and
//! renewed through `auth::SessionAuthority`.

pub mod error;
pub mod gateway;
pub mod transport;

pub use error::ApiError;
pub use gateway::Gateway;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport, TransportError};
