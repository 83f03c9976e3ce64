use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::manager::CacheManager;
use super::meter::Pressure;
use crate::types::{PagingError, Result};

enum MonitorMessage {
    Poke,
    Shutdown,
}

/// Background thread delivering low-memory signals to a [`CacheManager`].
///
/// The monitor polls the manager's heap meter and calls
/// [`CacheManager::on_low_memory_signal`] when usage crosses the high
/// watermark. The signal is edge-triggered: it fires once per crossing and
/// re-arms as soon as a reading is at or below the high watermark, or the
/// signal itself brought usage below the low watermark.
pub struct HeapMonitor {
    sender: Sender<MonitorMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HeapMonitor {
    /// Starts monitoring `manager` at its configured interval.
    ///
    /// The monitor holds only a weak reference and exits on its own once the
    /// manager is dropped.
    pub fn spawn(manager: &Arc<CacheManager>) -> Result<Self> {
        let interval = manager.config().monitor_interval();
        let weak = Arc::downgrade(manager);
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("largeimage-heap-monitor".to_string())
            .spawn(move || monitor_loop(weak, receiver, interval))
            .map_err(PagingError::from)?;
        info!(interval_ms = interval.as_millis() as u64, "pager.monitor.start");
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Requests an immediate pressure check.
    pub fn poke(&self) {
        let _ = self.sender.send(MonitorMessage::Poke);
    }

    /// Stops the monitor and waits for its thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(MonitorMessage::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            info!("pager.monitor.stop");
        }
    }
}

impl Drop for HeapMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(manager: Weak<CacheManager>, receiver: Receiver<MonitorMessage>, interval: Duration) {
    let mut armed = true;
    loop {
        match receiver.recv_timeout(interval) {
            Ok(MonitorMessage::Poke) | Err(RecvTimeoutError::Timeout) => {}
            Ok(MonitorMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match manager.pressure() {
            Pressure::Critical if armed => {
                armed = false;
                let report = manager.on_low_memory_signal();
                debug!(
                    batches = report.batches,
                    evicted = report.evicted,
                    written_back = report.written_back,
                    relieved = report.relieved,
                    "pager.monitor.signal"
                );
                // Loads racing the signal may push usage back over high; that
                // is a fresh crossing once the signal got below low.
                armed = report.relieved || manager.pressure() != Pressure::Critical;
            }
            Pressure::Critical => {}
            Pressure::Elevated | Pressure::Normal => armed = true,
        }
    }
}
