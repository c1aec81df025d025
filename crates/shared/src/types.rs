use num_enum::{FromPrimitive, IntoPrimitive};

// ForwardServer states
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ForwardState {
    Listening = 0,
    Opening = 1,
    Processing = 2,
    #[num_enum(default)]
    Error = 3,
}

// SSH forwarder states. Coarser than the TLS one: the SSH transport is
// established before the listener starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SshForwardState {
    Starting = 0,
    Ok = 1,
    #[num_enum(default)]
    Error = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Linux,
    Windows,
    MacOs,
    Unknown,
}

impl OsType {
    pub const fn detected() -> Self {
        if cfg!(target_os = "linux") {
            OsType::Linux
        } else if cfg!(target_os = "windows") {
            OsType::Windows
        } else if cfg!(target_os = "macos") {
            OsType::MacOs
        } else {
            OsType::Unknown
        }
    }
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OsType::Linux => "Linux",
            OsType::Windows => "Windows",
            OsType::MacOs => "MacOS",
            OsType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_state_from_primitive() {
        assert_eq!(ForwardState::from(0u8), ForwardState::Listening);
        assert_eq!(ForwardState::from(2u8), ForwardState::Processing);
        // Unknown values collapse to the terminal state
        assert_eq!(ForwardState::from(200u8), ForwardState::Error);
    }

    #[test]
    fn test_ssh_state_ordering() {
        assert_eq!(u8::from(SshForwardState::Starting), 0);
        assert_eq!(u8::from(SshForwardState::Ok), 1);
        assert_eq!(u8::from(SshForwardState::Error), 2);
    }
}
