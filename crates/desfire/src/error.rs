use thiserror::Error;

/// Result type for DESFire crypto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for DESFire crypto operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed card response (wrong length, unexpected frame shape)
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    /// Mutual authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Cryptographic integrity failure (MAC, CRC or padding mismatch)
    #[error("Integrity check failed: {0}")]
    Integrity(&'static str),

    /// A key is unusable for the requested operation
    #[error("Invalid key: {0}")]
    InvalidKey(&'static str),

    /// Caller error detectable before any card exchange
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A secure messaging operation was attempted without an authenticated session
    #[error("No authenticated session")]
    NotAuthenticated,

    /// The system CSPRNG could not produce challenge bytes
    #[error("Entropy source failure")]
    Entropy,
}
