//! Registry access
//!
//! Image references, authentication, the authenticated HTTP transport and
//! the OCI distribution upload protocol.

pub mod auth;
pub mod reference;
pub mod transport;
pub mod writer;

pub use auth::{AuthConfig, AuthManager, Authenticator};
pub use reference::{Reference, is_insecure_registry};
pub use transport::{AuthTransport, ManagedTransport, RequestSender, build_http_client};
pub use writer::{BlobOutcome, RegistryWriter, WriteOptions, WriteOutcome};
