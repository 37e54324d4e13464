use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the server and understood by the client
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    AuthSucceeded = 235,
    Ok = 250,
    CannotVerify = 252,
    AuthContinue = 334,
    StartMailInput = 354,
    /// Not a registered SMTP code, used for dropping idle clients
    Timeout = 420,
    Unavailable = 421,
    ActionUnavailable = 451,
    InsufficientStorage = 454,
    ServerUnableToAccommodate = 455,
    LineTooLong = 500,
    InvalidArguments = 501,
    Unimplemented = 502,
    InvalidCommandSequence = 503,
    ParameterNotImplemented = 504,
    AuthRequired = 530,
    AuthFailed = 535,
    Error = 550,
    UserNotLocal = 551,
    ExceededStorage = 552,
    TransactionFailed = 554,
    ParametersNotRecognised = 555,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        (200..400).contains(&u32::from(self))
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSucceeded,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            420 => Self::Timeout,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            454 => Self::InsufficientStorage,
            455 => Self::ServerUnableToAccommodate,
            500 => Self::LineTooLong,
            501 => Self::InvalidArguments,
            502 => Self::Unimplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            550 => Self::Error,
            551 => Self::UserNotLocal,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            555 => Self::ParametersNotRecognised,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSucceeded => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Timeout => 420,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::InsufficientStorage => 454,
            Status::ServerUnableToAccommodate => 455,
            Status::LineTooLong => 500,
            Status::InvalidArguments => 501,
            Status::Unimplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::Error => 550,
            Status::UserNotLocal => 551,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::ParametersNotRecognised => 555,
            Status::Unknown(v) => v,
        }
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        Self::from(u32::from(value))
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}
