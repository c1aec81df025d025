use std::ops::Range;

// Pause between attempts when the broker reports the service is not ready yet
pub const RETRY_DELAY_SECS: u64 = 10;

// Whole handshake + command exchange against the gateway must fit here
pub const OPEN_TUNNEL_TIMEOUT_SECS: u64 = 10;

pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 5;

// Listener stoppable timer default, when the descriptor says 0
pub const DEFAULT_LISTEN_TIMEOUT_SECS: u64 = 60;

pub const SSH_DEFAULT_WAIT_SECS: u64 = 10;

// Local ports picked for SSH listeners when the descriptor leaves them out
pub const SSH_LOCAL_PORT_RANGE: Range<u16> = 40000..50000;
pub const SSH_CLONE_PORT_RANGE: Range<u16> = 33000..53000;

// Post session cleanup pacing
pub const END_SCRIPT_DELAY_SECS: u64 = 3;
pub const EARLY_UNLINK_GRACE_SECS: u64 = 3;
pub const LATE_UNLINK_GRACE_SECS: u64 = 5;

// Only the tail of the captured log is uploaded
pub const LOG_TAIL_BYTES: usize = 64 * 1024;
