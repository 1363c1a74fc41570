//! Errors surfaced by a hub session.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hub did not advertise the required base protocol feature")]
    MissingBaseProtocol,

    #[error("malformed SID: {0:?}")]
    MalformedSid(String),

    #[error("malformed command: {0:?}")]
    Malformed(String),

    #[error("certificate verification failed and no pinned keyprint matched")]
    KeyprintMismatch,

    #[error("login timed out after {0:?} in a pre-NORMAL state")]
    LoginTimeout(std::time::Duration),

    #[error("a second SID for a known CID was rejected (hostile or buggy hub)")]
    DuplicateSidForCid,

    #[error("command not permitted in the current session state")]
    NotPermittedInState,

    #[error("refusing to connect to a protected hub hostname: {0}")]
    ProtectedCtmTarget(String),
}
