use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The top-level result type for segment, rebuild and GC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the conditions that may come up while
/// allocating, persisting and reclaiming segments.
#[derive(Debug)]
pub enum Error {
    /// A read or write error has happened when interacting with a
    /// metadata file or the device.
    Io(io::Error),
    /// Persisted metadata could not be decoded.
    Corruption {
        /// The metadata file the corrupted data was read from.
        file: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened. Please open an issue!
    ReportableBug(String),
    /// The copier factory could not produce a copy pipeline.
    CopierUnavailable,
    /// A GC control operation was issued while no copy pipeline runs.
    NoActiveCopier,
    /// The copy pipeline's threshold check had already been turned off.
    ThresholdCheckAlreadyDisabled,
    /// A stripe was flushed or queried without an attached reverse map.
    MissingReverseMap,
    /// A reverse map was linked to a stripe that still holds one.
    ReverseMapAlreadyLinked,
    /// Every segment is in use.
    NoFreeSegment,
    /// User stripe allocation is held back until garbage collection
    /// frees segments.
    UserAllocationProhibited,
    /// A lock was contended; the caller should try again later.
    Retry,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            Corruption { file, reason } => {
                Corruption { file: file.clone(), reason: reason.clone() }
            }
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
            CopierUnavailable => CopierUnavailable,
            NoActiveCopier => NoActiveCopier,
            ThresholdCheckAlreadyDisabled => ThresholdCheckAlreadyDisabled,
            MissingReverseMap => MissingReverseMap,
            ReverseMapAlreadyLinked => ReverseMapAlreadyLinked,
            NoFreeSegment => NoFreeSegment,
            UserAllocationProhibited => UserAllocationProhibited,
            Retry => Retry,
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            // io errors carry no useful equality
            (Io(_), _) => false,
            (
                Corruption { file: lf, reason: lr },
                Corruption { file: rf, reason: rr },
            ) => lf == rf && lr == rr,
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (CopierUnavailable, CopierUnavailable)
            | (NoActiveCopier, NoActiveCopier)
            | (ThresholdCheckAlreadyDisabled, ThresholdCheckAlreadyDisabled)
            | (MissingReverseMap, MissingReverseMap)
            | (ReverseMapAlreadyLinked, ReverseMapAlreadyLinked)
            | (NoFreeSegment, NoFreeSegment)
            | (UserAllocationProhibited, UserAllocationProhibited)
            | (Retry, Retry) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { ref file, ref reason } => {
                write!(f, "Read corrupted metadata from {}: {}", file, reason)
            }
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            CopierUnavailable => {
                write!(f, "failed to create a GC copy pipeline")
            }
            NoActiveCopier => write!(f, "no GC copy pipeline is running"),
            ThresholdCheckAlreadyDisabled => {
                write!(f, "GC threshold check is already disabled")
            }
            MissingReverseMap => {
                write!(f, "stripe has no reverse map linked to it")
            }
            ReverseMapAlreadyLinked => {
                write!(f, "stripe already has a reverse map linked to it")
            }
            NoFreeSegment => write!(f, "no free segment is available"),
            UserAllocationProhibited => write!(
                f,
                "user stripe allocation is prohibited until GC frees segments"
            ),
            Retry => write!(f, "resource is busy, retry later"),
        }
    }
}
