//! Transaction-level error taxonomy (spec §7) plus the `here!()` breadcrumb macro the
//! rest of the crate uses when wrapping infrastructure failures in `anyhow::Context`.

/// Ripped from the teacher's own `errors.rs`: a cheap way to tag an `anyhow::Context`
/// call with the call site instead of only the message.
#[macro_export]
macro_rules! here {
    () => {
        concat!("at ", file!(), " line ", line!(), " column ", column!())
    };
}

/// One of these is returned by every transaction handler on failure. Never carries a
/// backtrace or wraps an arbitrary `anyhow::Error` — infrastructure failures are a
/// different error type (`anyhow::Error`) that never crosses the handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("malformed payload")]
    Malformed,
    #[error("not permitted")]
    NotPermitted,
    #[error("not found")]
    NotFound,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("bad parameter")]
    BadParameter,
    #[error("conflict")]
    Conflict,
    #[error("fatal")]
    Fatal,
}

impl TxError {
    /// Numeric code persisted in `DbTxList` alongside validity, matching spec §7's
    /// "Handlers return a negative error code".
    pub fn code(self) -> i32 {
        match self {
            TxError::Malformed => -1,
            TxError::NotPermitted => -2,
            TxError::NotFound => -3,
            TxError::InsufficientFunds => -4,
            TxError::BadParameter => -5,
            TxError::Conflict => -6,
            TxError::Fatal => -7,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, TxError::Fatal)
    }
}

pub type TxResult<T> = Result<T, TxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no marker output present")]
    NoMarker,
    #[error("previous output could not be resolved")]
    MissingInput,
    #[error("payload read past end of buffer")]
    Malformed,
    #[error("unknown message type {0}")]
    UnknownType(u16),
}
