//! Driver error codes
//!
//! One crate-wide error enum; every fallible operation returns `WifiResult`.

use core::fmt;

/// Driver error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    /// A parameter failed validation (null/zero handle, out-of-range length)
    BadArg,
    /// Encoded request would overrun the negotiated IOVAR buffer limit
    BadLength,
    /// The buffer pool could not provide a packet
    BufferAllocFail,
    /// Host allocation failed
    Malloc,
    /// Event subscription table is full
    TooManySubscriptions,
    /// PMKID cache is full
    NoResourcesForPmkidCache,
    /// Operation requires the WLAN interface to be up
    InterfaceNotUp,
    /// Operation requires an association that does not exist
    NotAssociated,
    /// Join status bits form no defined combination
    InvalidJoinStatus,
    /// Interface handle does not name a live interface
    InvalidInterface,
    /// Interface role does not permit the operation
    InvalidRole,
    /// Security type is not one the driver understands
    UnknownSecurityType,
    /// WEP is refused for station joins
    WepNotAllowed,
    /// Key material has an invalid length for the chosen security
    InvalidKey,
    /// Firmware reported the command or variable as unsupported
    WlanUnsupported,
    /// Feature is not implemented by this driver
    Unsupported,
    /// No BSS matching the join target was found
    NetworkNotFound,
    /// Join did not reach the authenticated state
    NotAuthenticated,
    /// Association is up but keys were never exchanged
    NotKeyed,
    /// A join attempt is already in flight on this interface
    JoinInProgress,
    /// A required prepare step could not be completed
    Unfinished,
    /// EAPOL message 1 was never received
    EapolKeyPacketM1Timeout,
    /// EAPOL message 3 was never received
    EapolKeyPacketM3Timeout,
    /// Group key handshake message 1 was never received
    EapolKeyPacketG1Timeout,
    /// Firmware supplicant rejected the handshake
    EapolKeyFailure,
    /// Firmware returned a failure status for a control message
    IoctlFail,
    /// No response to a control message within the bus timeout
    IoctlTimeout,
    /// Response transaction id did not match the request
    BadTxId,
    /// Chip could not be brought to the awake state
    BusUpFail,
    /// Target backplane core is held in reset
    CoreInReset,
    /// Target backplane core has no clock
    CoreClockNotEnabled,
    /// A synchronous scan filled the caller's capacity before completing
    PartialResults,
    /// No packet filter with the given id exists
    FilterNotFound,
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WifiError::BadArg => "bad argument",
            WifiError::BadLength => "request exceeds iovar buffer limit",
            WifiError::BufferAllocFail => "buffer pool exhausted",
            WifiError::Malloc => "allocation failed",
            WifiError::TooManySubscriptions => "event table full",
            WifiError::NoResourcesForPmkidCache => "pmkid cache full",
            WifiError::InterfaceNotUp => "interface not up",
            WifiError::NotAssociated => "not associated",
            WifiError::InvalidJoinStatus => "undefined join status combination",
            WifiError::InvalidInterface => "invalid interface",
            WifiError::InvalidRole => "invalid interface role",
            WifiError::UnknownSecurityType => "unknown security type",
            WifiError::WepNotAllowed => "wep not allowed",
            WifiError::InvalidKey => "invalid key",
            WifiError::WlanUnsupported => "unsupported by firmware",
            WifiError::Unsupported => "unsupported by driver",
            WifiError::NetworkNotFound => "network not found",
            WifiError::NotAuthenticated => "not authenticated",
            WifiError::NotKeyed => "keys not exchanged",
            WifiError::JoinInProgress => "join already in progress",
            WifiError::Unfinished => "join preparation incomplete",
            WifiError::EapolKeyPacketM1Timeout => "eapol m1 timeout",
            WifiError::EapolKeyPacketM3Timeout => "eapol m3 timeout",
            WifiError::EapolKeyPacketG1Timeout => "eapol g1 timeout",
            WifiError::EapolKeyFailure => "eapol handshake failure",
            WifiError::IoctlFail => "ioctl failed",
            WifiError::IoctlTimeout => "ioctl timed out",
            WifiError::BadTxId => "response id mismatch",
            WifiError::BusUpFail => "bus wake failed",
            WifiError::CoreInReset => "core in reset",
            WifiError::CoreClockNotEnabled => "core clock not enabled",
            WifiError::PartialResults => "partial scan results",
            WifiError::FilterNotFound => "filter not found",
        };
        f.write_str(s)
    }
}

pub type WifiResult<T> = core::result::Result<T, WifiError>;

/// Collapse a firmware "unsupported" response for optional features.
///
/// Returns `Ok(None)` where the firmware lacks the variable, so callers can
/// continue without the feature.
pub fn ignore_unsupported<T>(result: WifiResult<T>) -> WifiResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(WifiError::WlanUnsupported) => Ok(None),
        Err(e) => Err(e),
    }
}
