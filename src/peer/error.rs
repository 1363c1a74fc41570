//! Errors surfaced by a peer connection.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer required TLS but the socket is plaintext")]
    RequireTlsViolation,

    #[error("peer CID is unknown to us")]
    UnknownCid,

    #[error("pinned keyprint did not verify against the peer certificate")]
    KeyprintMismatch,

    #[error("no CQI matches token {0:?}")]
    UnmatchedToken(String),

    #[error("PM connection requires the peer's TLS flag")]
    PmRequiresTls,

    #[error("malformed peer command: {0:?}")]
    Malformed(String),

    #[error("unsupported ADCGET/ADCSND transfer type: {0:?}")]
    UnsupportedType(String),

    #[error("ADCSND response size {got} exceeds the requested {requested}")]
    OversizedResponse { requested: u64, got: u64 },

    #[error("NMDC direction tie: both sides proposed the same random number")]
    DirectionTie,
}
