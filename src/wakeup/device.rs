//! Device capability glue.
//!
//! A [`Device`] records whether it can wake the system, which wakeup source
//! (if any) is attached to it, and an optional dedicated [`WakeIrq`].
//! [`Device::attach`] and [`Device::detach`] only link the two; registering
//! the source is the job of the [`WakeupContext`](super::WakeupContext)
//! helpers such as `enable_wakeup`.

use super::source::WakeupSource;
use crate::error::{Result, WakeupError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A dedicated wake interrupt line of a device.
///
/// The suspend path arms every wake IRQ linked to a registered source
/// before suspending and disarms them on resume.
#[derive(Debug)]
pub struct WakeIrq {
    irq: u32,
    armed: AtomicBool,
}

impl WakeIrq {
    /// Creates a disarmed wake IRQ.
    #[must_use]
    pub fn new(irq: u32) -> Arc<Self> {
        Arc::new(Self {
            irq,
            armed: AtomicBool::new(false),
        })
    }

    /// Interrupt number.
    #[must_use]
    pub const fn irq(&self) -> u32 {
        self.irq
    }

    /// Returns true while armed for wakeup.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub(crate) struct DevicePower {
    pub(crate) can_wakeup: bool,
    pub(crate) wakeup: Option<Arc<WakeupSource>>,
    pub(crate) wake_irq: Option<Arc<WakeIrq>>,
}

/// A device that may wake the system.
pub struct Device {
    name: String,
    power: Mutex<DevicePower>,
}

impl Device {
    /// Creates a device that cannot wake the system yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            power: Mutex::new(DevicePower::default()),
        })
    }

    /// Device name; also the name of sources registered for it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares whether the device can wake the system.
    ///
    /// Clearing the capability does not detach an attached source; use
    /// [`WakeupContext::set_wakeup_capable`](super::WakeupContext::set_wakeup_capable)
    /// for that.
    pub fn set_can_wakeup(&self, capable: bool) {
        self.power.lock().can_wakeup = capable;
    }

    /// Returns true if the device can wake the system.
    #[must_use]
    pub fn can_wakeup(&self) -> bool {
        self.power.lock().can_wakeup
    }

    /// Returns true if the device can wake the system and wakeup is enabled.
    #[must_use]
    pub fn may_wakeup(&self) -> bool {
        let power = self.power.lock();
        power.can_wakeup && power.wakeup.is_some()
    }

    /// The attached wakeup source, if any.
    #[must_use]
    pub fn wakeup_source(&self) -> Option<Arc<WakeupSource>> {
        self.power.lock().wakeup.clone()
    }

    /// Assigns a dedicated wake IRQ. Takes effect on the next attach.
    pub fn set_wake_irq(&self, irq: Arc<WakeIrq>) {
        self.power.lock().wake_irq = Some(irq);
    }

    /// Removes the dedicated wake IRQ.
    pub fn clear_wake_irq(&self) -> Option<Arc<WakeIrq>> {
        self.power.lock().wake_irq.take()
    }

    /// The dedicated wake IRQ, if any.
    #[must_use]
    pub fn wake_irq(&self) -> Option<Arc<WakeIrq>> {
        self.power.lock().wake_irq.clone()
    }

    /// Associates `source` with the device.
    ///
    /// The device's wake IRQ, if any, is linked to the source so the suspend
    /// path can arm it. Fails with [`WakeupError::AlreadyExists`] if a source
    /// is already attached; the caller decides whether that is fatal.
    pub fn attach(&self, source: &Arc<WakeupSource>) -> Result<()> {
        let mut power = self.power.lock();
        if power.wakeup.is_some() {
            return Err(WakeupError::AlreadyExists {
                device: self.name.clone(),
            });
        }
        if let Some(irq) = &power.wake_irq {
            source.lock().wake_irq = Some(Arc::clone(irq));
        }
        power.wakeup = Some(Arc::clone(source));
        Ok(())
    }

    /// Dissociates and returns the attached source.
    pub fn detach(&self) -> Result<Arc<WakeupSource>> {
        let source = self
            .power
            .lock()
            .wakeup
            .take()
            .ok_or_else(|| WakeupError::NoSource {
                device: self.name.clone(),
            })?;
        source.lock().wake_irq = None;
        Ok(source)
    }

    #[cfg(test)]
    pub(crate) fn power(&self) -> parking_lot::MutexGuard<'_, DevicePower> {
        self.power.lock()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let power = self.power.lock();
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("can_wakeup", &power.can_wakeup)
            .field("has_source", &power.wakeup.is_some())
            .field("wake_irq", &power.wake_irq.as_ref().map(|irq| irq.irq()))
            .finish()
    }
}
