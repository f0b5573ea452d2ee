use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;
use std::os::raw::c_int;
use std::result;

use crate::store;

/// The error type for operations with [`Env`] and its write engine.
///
/// [`Env`]: struct.Env.html
#[derive(Debug)]
pub enum Error {
    InvalidOption(&'static str),

    NotAbortable,
    NotNested,
    TxnActive,
    InUse,
    Uncompleted,

    BatchCommitted,
    Protocol(&'static str),

    Decompress,
    DecompressTooLarge,
    BadSentinel(u8),
    Corrupted,

    Store(c_int),
    Io(IoError),
}

impl Error {
    /// Numeric code of this error. Store errors keep the rc of the
    /// underlying store; crate errors use a reserved negative range.
    pub fn code(&self) -> i32 {
        match *self {
            Error::InvalidOption(_) => -1000,

            Error::NotAbortable => -1010,
            Error::NotNested => -1014,
            Error::TxnActive => -1011,
            Error::InUse => -1012,
            Error::Uncompleted => -1013,

            Error::BatchCommitted => -1020,
            Error::Protocol(_) => -1021,

            Error::Decompress => -1030,
            Error::DecompressTooLarge => -1031,
            Error::BadSentinel(_) => -1032,
            Error::Corrupted => -1033,

            Error::Store(rc) => rc as i32,
            Error::Io(_) => -2030,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Error::InvalidOption(opt) => write!(f, "Invalid option: {}", opt),

            Error::NotAbortable => write!(f, "Cannot abort this transaction"),
            Error::NotNested => write!(f, "No nested transaction is open"),
            Error::TxnActive => write!(f, "A write transaction is active"),
            Error::InUse => write!(f, "Already in use"),
            Error::Uncompleted => {
                write!(f, "Nested transaction is still open")
            }

            Error::BatchCommitted => {
                write!(f, "Batch transaction is already committed")
            }
            Error::Protocol(msg) => {
                write!(f, "Instruction stream error: {}", msg)
            }

            Error::Decompress => write!(f, "Failed to decompress data"),
            Error::DecompressTooLarge => {
                write!(f, "Decompressed data exceeds target buffer")
            }
            Error::BadSentinel(byte) => {
                write!(f, "Unknown status byte {}", byte)
            }
            Error::Corrupted => write!(f, "Record is corrupted"),

            Error::Store(rc) => write!(f, "{}", store::strerror(rc)),
            Error::Io(ref err) => err.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (&Error::InvalidOption(a), &Error::InvalidOption(b)) => a == b,

            (&Error::NotAbortable, &Error::NotAbortable) => true,
            (&Error::NotNested, &Error::NotNested) => true,
            (&Error::TxnActive, &Error::TxnActive) => true,
            (&Error::InUse, &Error::InUse) => true,
            (&Error::Uncompleted, &Error::Uncompleted) => true,

            (&Error::BatchCommitted, &Error::BatchCommitted) => true,
            (&Error::Protocol(a), &Error::Protocol(b)) => a == b,

            (&Error::Decompress, &Error::Decompress) => true,
            (&Error::DecompressTooLarge, &Error::DecompressTooLarge) => true,
            (&Error::BadSentinel(a), &Error::BadSentinel(b)) => a == b,
            (&Error::Corrupted, &Error::Corrupted) => true,

            (&Error::Store(a), &Error::Store(b)) => a == b,
            (&Error::Io(ref a), &Error::Io(ref b)) => a.kind() == b.kind(),

            (_, _) => false,
        }
    }
}

/// A specialized [`Result`] type for batchdb operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_rc() {
        let err = Error::Store(store::NOTFOUND);
        assert_eq!(err.code(), store::NOTFOUND as i32);
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn crate_errors_use_reserved_range() {
        assert_eq!(Error::InvalidOption("map_size").code(), -1000);
        assert_eq!(Error::BadSentinel(250), Error::BadSentinel(250));
        assert_ne!(Error::Decompress, Error::DecompressTooLarge);
    }
}
