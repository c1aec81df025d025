use shared::log;

/// Feedback surface handed to the transport dispatcher. The graphical
/// progress window implements this on desktop builds; the CLI uses the
/// console, and minimal mode absorbs everything.
pub trait HostApp: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

pub struct ConsoleHost;

impl HostApp for ConsoleHost {
    fn info(&self, message: &str) {
        log::info!("{}", message);
        println!("{}", message);
    }

    fn error(&self, message: &str) {
        log::error!("{}", message);
        eprintln!("{}", message);
    }
}

/// Minimal mode sink: accepts every call and does nothing.
pub struct SilentHost;

impl HostApp for SilentHost {
    fn info(&self, _message: &str) {}

    fn error(&self, message: &str) {
        // Errors still reach the log, just not the user surface
        log::debug!("(minimal) {}", message);
    }
}
