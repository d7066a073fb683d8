pub mod certs;
pub mod classify;
pub mod probe;
pub mod result;
pub mod transport;

pub mod prelude {
    pub use super::certs::TrustAnchors;
    pub use super::classify::{ErrorClass, StatusCode, classify};
    pub use super::probe::{DEFAULT_TIMEOUT, ProbeRunner};
    pub use super::result::{ConnectionInfo, ProbeOutcome, ProbeResult};
    pub use super::transport::{OpenSslTransport, Transport};
}
