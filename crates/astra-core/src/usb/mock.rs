//! Scripted device link for exercising the session state machine without
//! hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::link::{DeviceLink, EventSink, LinkEvent, UsbError};

/// Mock link: captures writes, lets tests inject interrupts and
/// disconnects. Events injected before `enable_interrupts` queue up and are
/// delivered in order once enabled, matching the real session.
pub struct MockLink {
    usb_path: String,
    sink: Mutex<Option<EventSink>>,
    queued: Mutex<VecDeque<LinkEvent>>,
    enabled: AtomicBool,
    running: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
    interrupt_writes: Mutex<Vec<Vec<u8>>>,
}

impl MockLink {
    pub fn new(usb_path: impl Into<String>) -> Self {
        Self {
            usb_path: usb_path.into(),
            sink: Mutex::new(None),
            queued: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            interrupt_writes: Mutex::new(Vec::new()),
        }
    }

    fn deliver(&self, event: LinkEvent) {
        if self.enabled.load(Ordering::SeqCst) {
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink(event);
                return;
            }
        }
        self.queued.lock().unwrap().push_back(event);
    }

    /// Inject one inbound interrupt packet.
    pub fn push_interrupt(&self, bytes: &[u8]) {
        self.deliver(LinkEvent::Interrupt(bytes.to_vec()));
    }

    /// Simulate a device disconnect.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.deliver(LinkEvent::NoDevice);
    }

    /// Simulate an unrecoverable transfer error.
    pub fn fail_transfer(&self) {
        self.deliver(LinkEvent::TransferError);
    }

    /// Make subsequent bulk writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All bulk writes, one entry per `write` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// All bulk bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.writes.lock().unwrap().concat()
    }

    /// All interrupt-OUT writes (console injections).
    pub fn interrupt_writes(&self) -> Vec<Vec<u8>> {
        self.interrupt_writes.lock().unwrap().clone()
    }
}

impl DeviceLink for MockLink {
    fn open(&self, sink: EventSink) -> Result<(), UsbError> {
        *self.sink.lock().unwrap() = Some(sink);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn enable_interrupts(&self) -> Result<(), UsbError> {
        self.enabled.store(true, Ordering::SeqCst);
        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink else {
            return Err(UsbError::NotRunning);
        };
        loop {
            let event = self.queued.lock().unwrap().pop_front();
            match event {
                Some(event) => sink(event),
                None => break,
            }
        }
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, UsbError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(UsbError::NotRunning);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(UsbError::Transfer(rusb::Error::Io));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn write_interrupt(&self, data: &[u8]) -> Result<(), UsbError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(UsbError::NotRunning);
        }
        self.interrupt_writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn usb_path(&self) -> &str {
        &self.usb_path
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn events_queue_until_enabled() {
        let link = MockLink::new("1-2.3");
        let seen: Arc<StdMutex<Vec<LinkEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink: EventSink = {
            let seen = seen.clone();
            Arc::new(move |ev| seen.lock().unwrap().push(ev))
        };

        link.open(sink).unwrap();
        link.push_interrupt(b"first");
        link.push_interrupt(b"second");
        assert!(seen.lock().unwrap().is_empty());

        link.enable_interrupts().unwrap();
        link.push_interrupt(b"third");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                LinkEvent::Interrupt(b"first".to_vec()),
                LinkEvent::Interrupt(b"second".to_vec()),
                LinkEvent::Interrupt(b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn write_capture_and_failure() {
        let link = MockLink::new("1-2");
        link.open(Arc::new(|_| {})).unwrap();
        link.write(b"hello").unwrap();
        assert_eq!(link.written_bytes(), b"hello");

        link.set_fail_writes(true);
        assert!(link.write(b"again").is_err());

        link.close();
        assert!(matches!(link.write(b"closed"), Err(UsbError::NotRunning)));
    }
}
