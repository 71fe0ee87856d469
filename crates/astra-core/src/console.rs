//! U-Boot console multiplexed onto the interrupt endpoints.
//!
//! Interrupt packets that are not image requests are console output. The
//! console buffers them, mirrors them to a per-device log file, and signals
//! whenever the buffered text ends at a U-Boot prompt.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Condvar, Mutex};

use tracing::debug;

const UBOOT_PROMPT: &str = "=>";
const LOG_FILE_NAME: &str = "console.log";

struct ConsoleState {
    data: String,
    log: Option<File>,
    prompt_seen: bool,
    shutdown: bool,
}

/// Console buffer for one device.
pub struct Console {
    state: Mutex<ConsoleState>,
    prompt_cv: Condvar,
}

impl Console {
    /// Create the console and its `console.log` inside `log_dir`.
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        let log = File::create(log_dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            state: Mutex::new(ConsoleState {
                data: String::new(),
                log: Some(log),
                prompt_seen: false,
                shutdown: false,
            }),
            prompt_cv: Condvar::new(),
        })
    }

    /// Append console output, mirror it to the log file, and signal the
    /// prompt waiter when the buffer ends at the U-Boot prompt.
    pub fn append(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.data.push_str(text);

        if let Some(log) = state.log.as_mut() {
            let _ = log.write_all(text.as_bytes());
            let _ = log.flush();
        }

        if state.data.trim_end().ends_with(UBOOT_PROMPT) {
            debug!("U-Boot prompt detected");
            state.prompt_seen = true;
            self.prompt_cv.notify_one();
        }
    }

    /// Block until the next prompt notification. Returns false once the
    /// console has been shut down.
    pub fn wait_for_prompt(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return false;
            }
            if state.prompt_seen {
                state.prompt_seen = false;
                return true;
            }
            state = self.prompt_cv.wait(state).unwrap();
        }
    }

    /// Everything received so far.
    pub fn contents(&self) -> String {
        self.state.lock().unwrap().data.clone()
    }

    /// Release any prompt waiter and close the log file.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.log.take();
        self.prompt_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn scratch_dir() -> std::path::PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "astra-console-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn detects_prompt_with_trailing_whitespace() {
        let dir = scratch_dir();
        let console = Console::new(&dir).unwrap();
        console.append("U-Boot 2019.10\r\n=> \r\n");
        assert!(console.wait_for_prompt());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn prompt_wakes_blocked_waiter() {
        let dir = scratch_dir();
        let console = Arc::new(Console::new(&dir).unwrap());
        let waiter = {
            let console = console.clone();
            std::thread::spawn(move || console.wait_for_prompt())
        };
        std::thread::sleep(Duration::from_millis(50));
        console.append("loading...\n");
        console.append("=>");
        assert!(waiter.join().unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shutdown_releases_waiter() {
        let dir = scratch_dir();
        let console = Arc::new(Console::new(&dir).unwrap());
        let waiter = {
            let console = console.clone();
            std::thread::spawn(move || console.wait_for_prompt())
        };
        std::thread::sleep(Duration::from_millis(50));
        console.shutdown();
        assert!(!waiter.join().unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mirrors_to_log_file() {
        let dir = scratch_dir();
        let console = Console::new(&dir).unwrap();
        console.append("hello ");
        console.append("world");
        assert_eq!(console.contents(), "hello world");
        let log = std::fs::read_to_string(dir.join(LOG_FILE_NAME)).unwrap();
        assert_eq!(log, "hello world");
        std::fs::remove_dir_all(&dir).ok();
    }
}
