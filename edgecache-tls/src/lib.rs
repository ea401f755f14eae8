//! Edgecache TLS Module
//!
//! Multi-domain TLS termination:
//! - Certificate store for statically configured hosts
//! - SNI-based certificate resolution at handshake time
//! - ACME (Let's Encrypt) automatic certificate management
//! - Per-listener TLS configuration (cipher suites, versions, curves)

pub mod acme;
pub mod builder;
pub mod cert_store;
pub mod manager;
pub mod resolver;

pub use acme::{
    AcmeError, AcmeIssuer, ChallengeHandler, ChallengeResponse, ChallengeType, IssuedCertificate,
    Issuer, MemoryChallengeHandler,
};
pub use builder::{HandshakeError, HostTls, ServerTlsBuilder, TlsError, TlsPolicy, TlsTerminator};
pub use cert_store::{CertStore, CertStoreError, CertificatePair};
pub use manager::{AutoCertError, AutoCertManager};
pub use resolver::{ResolveError, SingleCertResolver, SniResolver};
