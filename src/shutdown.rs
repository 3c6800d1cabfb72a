//! Cooperative shutdown signal
//!
//! Long-running work (the watchdog loop, a VPN connect) races its future
//! against [`Shutdown::wait`] and cleans up when the signal wins.

use tokio::sync::watch;
use tracing::warn;

pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Shutdown(rx)
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the signal has fired
    pub async fn wait(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Trigger gone without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Fire the returned signal on SIGINT/SIGTERM
pub fn install_interrupt_handler() -> Result<Shutdown, ctrlc::Error> {
    let (trigger, shutdown) = Shutdown::channel();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, shutting down");
        trigger.fire();
    })?;
    Ok(shutdown)
}
