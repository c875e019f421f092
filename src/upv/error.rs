use std::fmt;
use std::io;

/// Errors surfaced by the analyzer driver.
#[derive(Debug)]
pub enum UpvError {
    /// The libusb context could not be created.
    ContextInit(String),
    /// No analyzer matched the requested serial number.
    DeviceNotFound,
    /// A matching device exists but could not be prepared for use.
    OpenFailed { permission: bool, detail: &'static str },
    /// The device's configuration could not be selected and permissions were
    /// fine. Reported with the not-found code: another driver owns the
    /// device, so there is no usable analyzer.
    SetConfigurationFailed,
    /// A required string or configuration descriptor could not be fetched.
    DescriptorFetchFailed,
    /// Interface 0 could not be claimed.
    ClaimFailed { permission: bool },
    /// The initial vendor reset was rejected.
    ResetFailed,
    /// The operation requires an open device.
    DeviceNotOpen,
    /// The device returned an unreadable status word.
    DeviceStatus,
    /// Firmware push or a post-push status check failed.
    Load,
    /// A config-write frame was rejected or mis-echoed.
    WriteConfig,
    /// A capture thread could not be spawned.
    Thread(io::Error),
}

impl UpvError {
    /// Integer code matching the exported C-style error table.
    pub fn code(&self) -> i32 {
        match self {
            UpvError::DeviceNotFound | UpvError::SetConfigurationFailed => -1,
            UpvError::OpenFailed { .. }
            | UpvError::DescriptorFetchFailed
            | UpvError::ClaimFailed { .. }
            | UpvError::ResetFailed
            | UpvError::DeviceNotOpen => -2,
            UpvError::DeviceStatus => -3,
            UpvError::Load => -4,
            UpvError::WriteConfig => -5,
            UpvError::ContextInit(_) => -6,
            UpvError::Thread(_) => -12,
        }
    }
}

impl fmt::Display for UpvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpvError::ContextInit(detail) => write!(f, "device EE init fail: {detail}"),
            UpvError::DeviceNotFound => write!(f, "device not found"),
            UpvError::OpenFailed { permission: true, detail } => {
                write!(f, "{detail} (inappropriate permissions on device)")
            }
            UpvError::OpenFailed { permission: false, detail } => write!(f, "{detail}"),
            UpvError::SetConfigurationFailed => {
                write!(f, "unable to set usb configuration, make sure the default driver is not in use")
            }
            UpvError::DescriptorFetchFailed => write!(f, "unable to fetch device descriptors"),
            UpvError::ClaimFailed { permission: true } => {
                write!(f, "unable to claim usb device (inappropriate permissions on device)")
            }
            UpvError::ClaimFailed { permission: false } => {
                write!(f, "unable to claim usb device, make sure the default driver is not in use")
            }
            UpvError::ResetFailed => write!(f, "device reset failed, may not be an analyzer"),
            UpvError::DeviceNotOpen => write!(f, "device not open"),
            UpvError::DeviceStatus => write!(f, "device status error"),
            UpvError::Load => write!(f, "device init fail"),
            UpvError::WriteConfig => write!(f, "device write data fail"),
            UpvError::Thread(err) => write!(f, "device init process thread fail: {err}"),
        }
    }
}

impl std::error::Error for UpvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpvError::Thread(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UpvError;

    #[test]
    fn codes_match_exported_table() {
        assert_eq!(UpvError::DeviceNotFound.code(), -1);
        assert_eq!(UpvError::DeviceNotOpen.code(), -2);
        assert_eq!(UpvError::DeviceStatus.code(), -3);
        assert_eq!(UpvError::Load.code(), -4);
        assert_eq!(UpvError::WriteConfig.code(), -5);
        assert_eq!(UpvError::ContextInit(String::new()).code(), -6);
        assert_eq!(
            UpvError::Thread(std::io::Error::new(std::io::ErrorKind::Other, "x")).code(),
            -12
        );
    }

    #[test]
    fn open_variants_collapse_to_not_open() {
        for err in [
            UpvError::OpenFailed { permission: true, detail: "unable to set usb configuration" },
            UpvError::DescriptorFetchFailed,
            UpvError::ClaimFailed { permission: false },
            UpvError::ResetFailed,
        ] {
            assert_eq!(err.code(), -2);
        }
    }

    #[test]
    fn non_permission_config_failure_reports_not_found() {
        // Another driver holding the device reads as "no analyzer here",
        // unlike the permission-problem flavors of the same step.
        assert_eq!(UpvError::SetConfigurationFailed.code(), -1);
        assert_eq!(
            UpvError::OpenFailed {
                permission: true,
                detail: "unable to set usb configuration, make sure the default driver is not in use",
            }
            .code(),
            -2
        );
    }
}
