use thiserror::Error;

/// Status codes surfaced at the ioctl boundary.
pub const GSL_SUCCESS: i32 = 0;
pub const GSL_FAILURE: i32 = -1;
pub const GSL_FAILURE_SYSTEMERROR: i32 = -2;
pub const GSL_FAILURE_DEVICEERROR: i32 = -3;
pub const GSL_FAILURE_OUTOFMEM: i32 = -4;
pub const GSL_FAILURE_BADPARAM: i32 = -5;
pub const GSL_FAILURE_NOTSUPPORTED: i32 = -7;
pub const GSL_FAILURE_TIMEOUT: i32 = -8;
pub const GSL_FAILURE_NOTINITIALIZED: i32 = -9;
pub const GSL_FAILURE_ALREADYINITIALIZED: i32 = -10;

#[derive(Error, Debug)]
pub enum KgslError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation failed: {0}")]
    Failure(String),

    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Bad parameter: {0}")]
    BadParam(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("Operation timed out")]
    Timeout,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Wait interrupted by signal")]
    Interrupted,
}

impl KgslError {
    /// Maps the error onto the negative status code returned across the ioctl surface.
    #[must_use]
    pub const fn status(&self) -> i32 {
        match self {
            Self::Io(_) | Self::Interrupted => GSL_FAILURE_SYSTEMERROR,
            Self::Failure(_) => GSL_FAILURE,
            Self::OutOfMemory => GSL_FAILURE_OUTOFMEM,
            Self::BadParam(_) => GSL_FAILURE_BADPARAM,
            Self::NotSupported(_) => GSL_FAILURE_NOTSUPPORTED,
            Self::NotInitialized(_) => GSL_FAILURE_NOTINITIALIZED,
            Self::AlreadyInitialized => GSL_FAILURE_ALREADYINITIALIZED,
            Self::Timeout => GSL_FAILURE_TIMEOUT,
            Self::Device(_) => GSL_FAILURE_DEVICEERROR,
        }
    }

    pub(crate) fn bad_param(msg: impl Into<String>) -> Self {
        Self::BadParam(msg.into())
    }

    pub(crate) fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    pub(crate) fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }
}

// A convenient alias
pub type KgslResult<T> = Result<T, KgslError>;

/// Collapses a result into the two-valued status convention.
pub fn to_status<T>(res: &KgslResult<T>) -> i32 {
    match res {
        Ok(_) => GSL_SUCCESS,
        Err(e) => e.status(),
    }
}
