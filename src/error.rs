//! Error taxonomy for this crate.
//!
//! Follows the same shape as `glonax-runtime`'s `J1939UnitError`: a plain
//! enum with unit variants matched in `Display`, one variant wrapping
//! `std::io::Error` for driver-level syscall failures, and a manual
//! `std::error::Error` impl rather than a derive macro.

#[derive(Debug)]
pub enum Error {
    /// The named interface does not exist, or is not a CAN device.
    NoSuchInterface,
    /// The interface is bound but administratively down.
    InterfaceDown,
    /// Address claim failed, or an operation that requires a claimed address
    /// was attempted without one.
    AddressInUse,
    /// A malformed argument: bad filter combination, wrong option size, wrong
    /// payload length, and the like.
    InvalidArgument,
    /// A numeric argument fell outside its valid range.
    OutOfRange,
    /// Filter or frame registration failed for lack of resources.
    NoMemory,
    /// The requested operation or option is not supported by this endpoint.
    NotSupported,
    /// The bound interface was unregistered from under the endpoint.
    DeviceGone,
    /// The bound interface transitioned to administratively down.
    NetDown,
    /// A lower-level I/O failure, usually from the driver's socket.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::NoSuchInterface => "no such interface",
                Self::InterfaceDown => "interface is down",
                Self::AddressInUse => "address in use",
                Self::InvalidArgument => "invalid argument",
                Self::OutOfRange => "value out of range",
                Self::NoMemory => "out of memory",
                Self::NotSupported => "operation not supported",
                Self::DeviceGone => "device gone",
                Self::NetDown => "network is down",
                Self::Io(error) => return write!(f, "i/o error: {}", error),
            }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
