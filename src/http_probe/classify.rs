//! Maps low-level connection status codes to a coarse failure class.
//!
//! Status codes use the 32-bit layout the collected reports have always used:
//! network failures live in the `0x804B_xxxx` module, and security failures
//! live in `0x805A_xxxx` with the low word holding the negated NSS-style
//! error number. Within the security module the error number range decides
//! the class: `SEC_ERROR_*` and pkix errors are certificate problems,
//! `SSL_ERROR_*` are protocol problems (with the host-mismatch exception).

use std::fmt;

use serde::{Serialize, Serializer};

/// A raw connection status. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);

    pub fn is_ok(self) -> bool {
        self == StatusCode::OK
    }

    const fn network(low: u16) -> StatusCode {
        StatusCode(NETWORK_MODULE | low as u32)
    }

    /// Wraps an NSS-style (negative) security error number.
    pub const fn security(nss_error: i32) -> StatusCode {
        StatusCode(SECURITY_MODULE | (nss_error.unsigned_abs() & 0xFFFF))
    }

    fn module(self) -> u32 {
        self.0 & 0xFFFF_0000
    }

    /// The negative error number of a security-module code.
    fn nss_error(self) -> Option<i32> {
        (self.module() == SECURITY_MODULE).then(|| -((self.0 & 0xFFFF) as i32))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

const NETWORK_MODULE: u32 = 0x804B_0000;
const SECURITY_MODULE: u32 = 0x805A_0000;

const SEC_ERROR_BASE: i32 = -0x2000;
const SSL_ERROR_BASE: i32 = -0x3000;
const PKIX_ERROR_BASE: i32 = -0x4000;
const ERROR_RANGE: i32 = 0x1000;

pub const BINDING_ABORTED: StatusCode = StatusCode::network(0x02);
pub const CONNECTION_REFUSED: StatusCode = StatusCode::network(0x0D);
pub const NET_TIMEOUT: StatusCode = StatusCode::network(0x0E);
pub const OFFLINE: StatusCode = StatusCode::network(0x10);
pub const NET_RESET: StatusCode = StatusCode::network(0x14);
pub const UNKNOWN_HOST: StatusCode = StatusCode::network(0x1E);
pub const NET_INTERRUPT: StatusCode = StatusCode::network(0x47);
pub const PROXY_CONNECTION_REFUSED: StatusCode = StatusCode::network(0x48);
pub const NET_PARTIAL_TRANSFER: StatusCode = StatusCode::network(0x4C);

pub const BAD_SIGNATURE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 10);
pub const EXPIRED_CERTIFICATE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 11);
pub const REVOKED_CERTIFICATE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 12);
pub const UNKNOWN_ISSUER: StatusCode = StatusCode::security(SEC_ERROR_BASE + 13);
pub const UNTRUSTED_ISSUER: StatusCode = StatusCode::security(SEC_ERROR_BASE + 20);
pub const UNTRUSTED_CERT: StatusCode = StatusCode::security(SEC_ERROR_BASE + 21);
pub const EXPIRED_ISSUER_CERTIFICATE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 30);
pub const CA_CERT_INVALID: StatusCode = StatusCode::security(SEC_ERROR_BASE + 36);
pub const INADEQUATE_KEY_USAGE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 90);
pub const NOT_YET_VALID_CERTIFICATE: StatusCode = StatusCode::security(PKIX_ERROR_BASE + 5);
pub const SELF_SIGNED_CERT: StatusCode = StatusCode::security(PKIX_ERROR_BASE + 14);
pub const BAD_CERT_DOMAIN: StatusCode = StatusCode::security(SSL_ERROR_BASE + 12);

pub const NO_CYPHER_OVERLAP: StatusCode = StatusCode::security(SSL_ERROR_BASE + 2);
pub const BAD_SERVER: StatusCode = StatusCode::security(SSL_ERROR_BASE + 7);
pub const UNSUPPORTED_VERSION: StatusCode = StatusCode::security(SSL_ERROR_BASE + 9);
pub const BAD_MAC_READ: StatusCode = StatusCode::security(SSL_ERROR_BASE + 15);
pub const RX_RECORD_TOO_LONG: StatusCode = StatusCode::security(SSL_ERROR_BASE + 25);
pub const RX_MALFORMED_SERVER_HELLO: StatusCode = StatusCode::security(SSL_ERROR_BASE + 29);
pub const HANDSHAKE_FAILURE_ALERT: StatusCode = StatusCode::security(SSL_ERROR_BASE + 61);
pub const PROTOCOL_VERSION_ALERT: StatusCode = StatusCode::security(SSL_ERROR_BASE + 134);
pub const INAPPROPRIATE_FALLBACK_ALERT: StatusCode = StatusCode::security(SSL_ERROR_BASE + 198);

// Unnamed codes; these classify as `*_OTHER`.
pub const GENERIC_NETWORK_FAILURE: StatusCode = StatusCode(0x8000_4005);
pub const GENERIC_CERT_FAILURE: StatusCode = StatusCode::security(SEC_ERROR_BASE + 0x3FF);
pub const GENERIC_SSL_FAILURE: StatusCode = StatusCode::security(SSL_ERROR_BASE + 0x3FF);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Certificate,
    Protocol,
    Network,
}

impl ErrorClass {
    fn fallback_name(self) -> &'static str {
        match self {
            ErrorClass::Certificate => "CERTIFICATE_OTHER",
            ErrorClass::Protocol => "PROTOCOL_OTHER",
            ErrorClass::Network => "NETWORK_OTHER",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Certificate => "certificate",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Network => "network",
        };
        f.write_str(name)
    }
}

const NAMED_CODES: &[(StatusCode, &str)] = &[
    (BINDING_ABORTED, "BINDING_ABORTED"),
    (CONNECTION_REFUSED, "CONNECTION_REFUSED"),
    (NET_TIMEOUT, "NET_TIMEOUT"),
    (OFFLINE, "OFFLINE"),
    (NET_RESET, "NET_RESET"),
    (UNKNOWN_HOST, "UNKNOWN_HOST"),
    (NET_INTERRUPT, "NET_INTERRUPT"),
    (PROXY_CONNECTION_REFUSED, "PROXY_CONNECTION_REFUSED"),
    (NET_PARTIAL_TRANSFER, "NET_PARTIAL_TRANSFER"),
    (BAD_SIGNATURE, "BAD_SIGNATURE"),
    (EXPIRED_CERTIFICATE, "EXPIRED_CERTIFICATE"),
    (REVOKED_CERTIFICATE, "REVOKED_CERTIFICATE"),
    (UNKNOWN_ISSUER, "UNKNOWN_ISSUER"),
    (UNTRUSTED_ISSUER, "UNTRUSTED_ISSUER"),
    (UNTRUSTED_CERT, "UNTRUSTED_CERT"),
    (EXPIRED_ISSUER_CERTIFICATE, "EXPIRED_ISSUER_CERTIFICATE"),
    (CA_CERT_INVALID, "CA_CERT_INVALID"),
    (INADEQUATE_KEY_USAGE, "INADEQUATE_KEY_USAGE"),
    (NOT_YET_VALID_CERTIFICATE, "NOT_YET_VALID_CERTIFICATE"),
    (SELF_SIGNED_CERT, "SELF_SIGNED_CERT"),
    (BAD_CERT_DOMAIN, "BAD_CERT_DOMAIN"),
    (NO_CYPHER_OVERLAP, "NO_CYPHER_OVERLAP"),
    (BAD_SERVER, "BAD_SERVER"),
    (UNSUPPORTED_VERSION, "UNSUPPORTED_VERSION"),
    (BAD_MAC_READ, "BAD_MAC_READ"),
    (RX_RECORD_TOO_LONG, "RX_RECORD_TOO_LONG"),
    (RX_MALFORMED_SERVER_HELLO, "RX_MALFORMED_SERVER_HELLO"),
    (HANDSHAKE_FAILURE_ALERT, "HANDSHAKE_FAILURE_ALERT"),
    (PROTOCOL_VERSION_ALERT, "PROTOCOL_VERSION_ALERT"),
    (INAPPROPRIATE_FALLBACK_ALERT, "INAPPROPRIATE_FALLBACK_ALERT"),
];

/// The class a code belongs to, decided by its module and error range alone.
fn class_of(code: StatusCode) -> ErrorClass {
    if code == BAD_CERT_DOMAIN {
        return ErrorClass::Certificate;
    }
    match code.nss_error() {
        Some(e) if (SEC_ERROR_BASE..SEC_ERROR_BASE + ERROR_RANGE).contains(&e) => {
            ErrorClass::Certificate
        }
        Some(e) if (PKIX_ERROR_BASE..PKIX_ERROR_BASE + ERROR_RANGE).contains(&e) => {
            ErrorClass::Certificate
        }
        Some(e) if (SSL_ERROR_BASE..SSL_ERROR_BASE + ERROR_RANGE).contains(&e) => {
            ErrorClass::Protocol
        }
        // other security-module codes are handshake-level failures
        Some(_) => ErrorClass::Protocol,
        None => ErrorClass::Network,
    }
}

/// Classifies any status code. Total: codes without a table entry get their
/// class's `*_OTHER` name, and codes outside every module count as network.
pub fn classify(code: StatusCode) -> (ErrorClass, &'static str) {
    let class = class_of(code);
    let name = NAMED_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map_or(class.fallback_name(), |(_, name)| *name);
    (class, name)
}
