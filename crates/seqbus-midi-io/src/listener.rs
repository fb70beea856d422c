//! Poll-driven input: a named thread per input bus.
//!
//! For backends that deliver input only when asked, the listener owns the bus,
//! drains it every poll interval and forwards messages over a bounded
//! crossbeam channel.

use crate::{Bus, Error, Message, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub struct InputListener {
    receiver: Receiver<Message>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Bus>>,
}

impl InputListener {
    /// Moves `bus` onto a listener thread. The bus must be an input bus.
    pub fn spawn(bus: Bus, poll_interval: Duration) -> Result<Self> {
        if !bus.is_input() {
            return Err(Error::InvalidPort {
                direction: bus.direction(),
                index: bus.index(),
            });
        }
        let capacity = bus.info().settings().queue_capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let name = format!("midi-in-{}", bus.index());

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::listen(bus, sender, running_clone, poll_interval))
            .map_err(|e| Error::Driver(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            receiver,
            running,
            handle: Some(handle),
        })
    }

    fn listen(
        mut bus: Bus,
        sender: Sender<Message>,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Bus {
        debug!("MIDI listener started on {}", bus.display_name());
        while running.load(Ordering::Acquire) {
            if bus.poll() == 0 {
                thread::sleep(poll_interval);
                continue;
            }
            while let Some(msg) = bus.receive() {
                match sender.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("MIDI listener channel full, message dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("MIDI listener receiver gone, stopping");
                        return bus;
                    }
                }
            }
        }
        debug!("MIDI listener stopped on {}", bus.display_name());
        bus
    }

    pub fn receiver(&self) -> &Receiver<Message> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        match self.receiver.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and hands the bus back.
    pub fn stop(mut self) -> Option<Bus> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Bus> {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(bus) => Some(bus),
            Err(_) => {
                warn!("MIDI listener thread panicked");
                None
            }
        }
    }
}

impl Drop for InputListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
