use core::fmt;

/// Crate-wide error type. The transport core reports failures through these
/// values or through typed events; it never panics across the public API.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LatticaError {
    /// A buffer or queue could not hold the requested data.
    OutOfMemory,
    /// A caller-supplied value was malformed or out of range.
    InvalidArgument,
    /// A signature or HMAC did not verify.
    IncorrectSignature,
    /// A hash had the wrong length or did not match its material.
    IncorrectHash,
    /// A cipher operation failed (bad padding, undecryptable token).
    CryptoError,
    /// A wire frame or packet field could not be parsed.
    PacketError,
    /// An interface could not be reached or went away.
    ConnectionError,
    /// A protocol deadline elapsed before completion.
    Timeout,
    /// The item was already seen and has been filtered.
    Duplicate,
}

impl fmt::Display for LatticaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LatticaError::OutOfMemory => "out of memory",
            LatticaError::InvalidArgument => "invalid argument",
            LatticaError::IncorrectSignature => "incorrect signature",
            LatticaError::IncorrectHash => "incorrect hash",
            LatticaError::CryptoError => "crypto error",
            LatticaError::PacketError => "packet error",
            LatticaError::ConnectionError => "connection error",
            LatticaError::Timeout => "timed out",
            LatticaError::Duplicate => "duplicate",
        };
        f.write_str(text)
    }
}

impl std::error::Error for LatticaError {}
