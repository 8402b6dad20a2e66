use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object to be used
/// across the codebase to tag errors with information that is used to
/// classify them at the daemon boundary.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// client.
///
/// The short_msg is used as a tag - available for tests and for log
/// filtering - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg AckTimeout
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

/// The closed set of error kinds at the replication core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The interpreter rejected an expression; client-recoverable.
    InvalidInput,
    /// A storage or pub/sub operation failed; retriable at the client level.
    Ipfs,
    /// A reader did not observe the matching `new_inputs` broadcast in time.
    AckTimeout,
    /// An internal logic invariant was violated.
    Internal,
    /// Registry invariant violation: the machine was already cached.
    MachineAlreadyCached,
    /// Registry invariant violation: the machine was expected in the cache.
    MachineNotCached,
}

impl ErrorMetadata {
    /// The interpreter rejected an expression. Maps to 400 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased tag describing the error.
    /// The msg should be the rendered interpreter error.
    pub fn invalid_input(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A storage or pub/sub operation against IPFS failed. Maps to 500 in
    /// HTTP. The underlying error is surfaced verbatim in msg.
    pub fn ipfs_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Ipfs,
            short_msg: IPFS_ERROR.into(),
            msg: msg.into(),
        }
    }

    /// The writer did not acknowledge a remote append within the ack window.
    /// Maps to 504 in HTTP; the writer may be offline.
    pub fn ack_timeout() -> Self {
        Self {
            code: ErrorCode::AckTimeout,
            short_msg: ACK_TIMEOUT.into(),
            msg: ACK_TIMEOUT_MSG.into(),
        }
    }

    /// Internal invariant violation (eg a malformed message leaked past a
    /// filter). Maps to 500 in HTTP.
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: INTERNAL_ERROR.into(),
            msg: msg.into(),
        }
    }

    /// Registry invariant violation: insert of an id that is already cached.
    /// Should never reach clients; if it does, bug.
    pub fn machine_already_cached(id: &str) -> Self {
        Self {
            code: ErrorCode::MachineAlreadyCached,
            short_msg: MACHINE_ALREADY_CACHED.into(),
            msg: format!("Machine {id} is already in the local cache").into(),
        }
    }

    /// Registry invariant violation: modify of an id that is not cached.
    /// Should never reach clients; if it does, bug.
    pub fn machine_not_cached(id: &str) -> Self {
        Self {
            code: ErrorCode::MachineNotCached,
            short_msg: MACHINE_NOT_CACHED.into(),
            msg: format!("Machine {id} is not in the local cache").into(),
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        self.code == ErrorCode::InvalidInput
    }

    pub fn is_ipfs_error(&self) -> bool {
        self.code == ErrorCode::Ipfs
    }

    pub fn is_ack_timeout(&self) -> bool {
        self.code == ErrorCode::AckTimeout
    }

    /// Return true if this error is deterministically caused by the client's
    /// own request and retrying it unchanged cannot succeed.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::InvalidInput => true,
            ErrorCode::Ipfs
            | ErrorCode::AckTimeout
            | ErrorCode::Internal
            | ErrorCode::MachineAlreadyCached
            | ErrorCode::MachineNotCached => false,
        }
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::AckTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Ipfs
            | ErrorCode::Internal
            | ErrorCode::MachineAlreadyCached
            | ErrorCode::MachineNotCached => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub const IPFS_ERROR: &str = "IpfsError";
pub const ACK_TIMEOUT: &str = "AckTimeout";
pub const ACK_TIMEOUT_MSG: &str =
    "The machine's writer did not acknowledge the request in time. It may be offline.";
pub const INTERNAL_ERROR: &str = "InternalServerError";
pub const INTERNAL_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const MACHINE_ALREADY_CACHED: &str = "MachineAlreadyCached";
pub const MACHINE_NOT_CACHED: &str = "MachineNotCached";

/// Classification helpers for `anyhow::Error` chains that may carry an
/// `ErrorMetadata` tag. Untagged errors classify as internal.
pub trait ErrorMetadataAnyhowExt {
    fn is_invalid_input(&self) -> bool;
    fn is_ipfs_error(&self) -> bool;
    fn is_ack_timeout(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_invalid_input(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_invalid_input();
        }
        false
    }

    fn is_ipfs_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_ipfs_error();
        }
        false
    }

    fn is_ack_timeout(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_ack_timeout();
        }
        false
    }

    fn is_deterministic_user_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_deterministic_user_error();
        }
        false
    }

    /// Returns the short_msg if there is ErrorMetadata attached, and a
    /// generic internal tag otherwise.
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    /// Returns the user-facing msg if there is ErrorMetadata attached, and a
    /// generic internal message otherwise.
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    fn http_status(&self) -> StatusCode {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code.http_status_code();
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Log an error with its full chain. Subscription handlers and background
/// workers route through here so faults are visible but swallowed.
pub fn report_error(err: &anyhow::Error) {
    let rendered = format!("{err:#}").replace('\n', "\\n");
    if err.is_deterministic_user_error() {
        tracing::warn!("Caught {} error: {rendered}", err.short_msg());
    } else {
        tracing::error!("Caught {} error: {rendered}", err.short_msg());
    }
    tracing::debug!("{err:?}");
}

/// Return Result<(), MainError> from main functions to render returned
/// errors once, without the noisy `Debug` chain duplication.
pub struct MainError(anyhow::Error);

impl<T: Into<anyhow::Error>> From<T> for MainError {
    fn from(e: T) -> Self {
        let err: anyhow::Error = e.into();
        report_error(&err);
        Self(err)
    }
}

impl std::fmt::Debug for MainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Just print the `Display` of the error rather than `Debug`, as
        // `report_error` above already rendered the full chain.
        write!(f, "{}", self.0)
    }
}
