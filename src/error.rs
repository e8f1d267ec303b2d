use thiserror::Error;

/// Result alias over the engine's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine, in ascending severity.
///
/// Conflicts between concurrent instructions are resolved internally by the
/// transformer and never surface here. Errors carry the originating byte
/// offset or instruction index, not prose; the transport layer decides
/// whether to retry, disconnect, or reset.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A changeset failed to decode: unknown tag, truncated input, or an
    /// interned-string index that does not resolve.
    #[error("bad changeset format at byte {offset}")]
    BadFormat {
        /// Byte offset into the encoded changeset.
        offset: usize,
    },
    /// An instruction referenced a table or column that does not exist in
    /// the receiving group and is not created by the instruction itself.
    #[error("unknown schema element at instruction {instruction}")]
    BadSchema {
        /// Index of the offending instruction.
        instruction: usize,
    },
    /// The applier hit a structural impossibility: an out-of-range index,
    /// a `prior_size` mismatch, a link to an object that never existed, or
    /// a type mismatch. After a well-formed merge this signals a
    /// transformer bug or a corrupt peer.
    #[error("unapplicable instruction {instruction}")]
    BadChangeset {
        /// Index of the offending instruction.
        instruction: usize,
    },
    /// Integration was cancelled between batches; group and history are
    /// unchanged for the remaining batches.
    #[error("integration cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn bad_format(offset: usize) -> Self {
        Error::BadFormat { offset }
    }

    pub(crate) fn bad_schema(instruction: usize) -> Self {
        Error::BadSchema { instruction }
    }

    pub(crate) fn bad_changeset(instruction: usize) -> Self {
        Error::BadChangeset { instruction }
    }
}
