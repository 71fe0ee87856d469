//! Cross-process critical section.
//!
//! Prevents parallel host processes from enumerating (and resetting) the
//! same device during a miniloader reset window. Windows uses a named
//! mutex; POSIX uses `flock` on a well-known path.

use std::time::Duration;

use super::TransportError;

/// Default acquisition timeout for enumeration passes.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(unix)]
pub use unix::CriticalSection;
#[cfg(windows)]
pub use windows::CriticalSection;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::sync::Mutex;
    use std::time::Instant;

    use tracing::{debug, warn};

    const LOCK_PATH: &str = "/tmp/astra-manager-critical-section.lock";
    const RETRY_INTERVAL: Duration = Duration::from_millis(50);

    /// `flock`-backed critical section shared by every astra process on
    /// the host.
    pub struct CriticalSection {
        file: Mutex<Option<File>>,
    }

    impl CriticalSection {
        pub fn new() -> Result<Self, TransportError> {
            let file = File::options()
                .create(true)
                .truncate(false)
                .write(true)
                .open(LOCK_PATH)?;
            Ok(Self {
                file: Mutex::new(Some(file)),
            })
        }

        pub fn acquire(&self, timeout: Duration) -> Result<(), TransportError> {
            let guard = self.file.lock().unwrap();
            let Some(file) = guard.as_ref() else {
                return Err(TransportError::MutexTimeout);
            };
            let deadline = Instant::now() + timeout;
            loop {
                let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
                if ret == 0 {
                    debug!("Acquired cross-process critical section");
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!("Timed out acquiring cross-process critical section");
                    return Err(TransportError::MutexTimeout);
                }
                std::thread::sleep(RETRY_INTERVAL);
            }
        }

        pub fn release(&self) {
            let guard = self.file.lock().unwrap();
            if let Some(file) = guard.as_ref() {
                unsafe {
                    libc::flock(file.as_raw_fd(), libc::LOCK_UN);
                }
                debug!("Released cross-process critical section");
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;

    use tracing::{debug, warn};
    use windows_sys::Win32::Foundation::{
        CloseHandle, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0,
    };
    use windows_sys::Win32::System::Threading::{CreateMutexW, ReleaseMutex, WaitForSingleObject};

    const MUTEX_NAME: &str = "Global\\AstraManagerCriticalSection";

    /// Named-mutex critical section shared by every astra process on the
    /// host. An abandoned mutex (a peer died while holding it) counts as
    /// acquired.
    pub struct CriticalSection {
        handle: HANDLE,
    }

    unsafe impl Send for CriticalSection {}
    unsafe impl Sync for CriticalSection {}

    impl CriticalSection {
        pub fn new() -> Result<Self, TransportError> {
            let name: Vec<u16> = MUTEX_NAME.encode_utf16().chain(std::iter::once(0)).collect();
            let handle = unsafe { CreateMutexW(std::ptr::null(), 0, name.as_ptr()) };
            if handle.is_null() {
                return Err(TransportError::Io(std::io::Error::last_os_error()));
            }
            Ok(Self { handle })
        }

        pub fn acquire(&self, timeout: Duration) -> Result<(), TransportError> {
            let millis = timeout.as_millis().min(u128::from(u32::MAX)) as u32;
            match unsafe { WaitForSingleObject(self.handle, millis) } {
                WAIT_OBJECT_0 | WAIT_ABANDONED => {
                    debug!("Acquired cross-process critical section");
                    Ok(())
                }
                _ => {
                    warn!("Timed out acquiring cross-process critical section");
                    Err(TransportError::MutexTimeout)
                }
            }
        }

        pub fn release(&self) {
            unsafe {
                ReleaseMutex(self.handle);
            }
            debug!("Released cross-process critical section");
        }
    }

    impl Drop for CriticalSection {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Both tests contend on the same well-known lock path.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn acquire_release_cycle() {
        let _serial = SERIAL.lock().unwrap();
        let cs = CriticalSection::new().unwrap();
        cs.acquire(Duration::from_millis(200)).unwrap();
        cs.release();
        cs.acquire(Duration::from_millis(200)).unwrap();
        cs.release();
    }

    #[test]
    fn contended_acquire_times_out() {
        let _serial = SERIAL.lock().unwrap();
        let first = CriticalSection::new().unwrap();
        let second = CriticalSection::new().unwrap();

        first.acquire(Duration::from_millis(200)).unwrap();
        assert!(matches!(
            second.acquire(Duration::from_millis(100)),
            Err(TransportError::MutexTimeout)
        ));
        first.release();
        second.acquire(Duration::from_millis(200)).unwrap();
        second.release();
    }
}
