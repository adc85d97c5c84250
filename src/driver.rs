//! Driver contract and device manager
//!
//! Peripheral drivers live outside the framework; they only meet it through
//! the uniform `init`/`suspend`/`resume` contract below.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{error, info, warn};
use spin::Mutex;

use crate::error::DriverError;

/// Target power state of a suspend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Clocks gated, context kept
    Suspend,
    /// Deep sleep, context lost
    Shutdown,
}

/// Driver trait that all drivers must implement
pub trait Driver: Send {
    /// Driver name
    fn name(&self) -> &str;

    /// Initialize the device
    fn init(&mut self) -> Result<(), DriverError>;

    /// Prepare the device for `state`
    fn suspend(&mut self, state: PowerState) -> Result<(), DriverError>;

    /// Restore the device after a suspend
    fn resume(&mut self) -> Result<(), DriverError>;
}

/// Failure of a device-wide power transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    /// Name of the failing driver
    pub driver: String,
    pub error: DriverError,
}

/// Device manager - tracks all registered drivers in bring-up order
pub struct DeviceManager {
    drivers: Mutex<Vec<Box<dyn Driver>>>,
}

impl DeviceManager {
    /// Create new device manager
    pub const fn new() -> Self {
        Self {
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Add a driver; drivers are initialized and resumed in this order
    pub fn register(&self, driver: Box<dyn Driver>) {
        self.drivers.lock().push(driver);
    }

    pub fn len(&self) -> usize {
        self.drivers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.lock().is_empty()
    }

    /// Initialize every driver; a failing driver is logged and skipped
    pub fn init_all(&self) -> usize {
        let mut failed = 0;
        for driver in self.drivers.lock().iter_mut() {
            if let Err(e) = driver.init() {
                error!("{}: init failed: {}", driver.name(), e);
                failed += 1;
            }
        }
        info!("devices initialized ({} failed)", failed);
        failed
    }

    /// Suspend drivers in reverse order. On failure the drivers already
    /// suspended are resumed again and the platform stays up.
    pub fn suspend_all(&self, state: PowerState) -> Result<(), DeviceFailure> {
        let mut drivers = self.drivers.lock();
        let count = drivers.len();
        for idx in (0..count).rev() {
            if let Err(error) = drivers[idx].suspend(state) {
                let failure = DeviceFailure {
                    driver: drivers[idx].name().to_string(),
                    error,
                };
                warn!("{}: suspend failed: {}, rolling back", failure.driver, error);
                for driver in drivers[idx + 1..].iter_mut() {
                    if let Err(e) = driver.resume() {
                        error!("{}: resume during rollback failed: {}", driver.name(), e);
                    }
                }
                return Err(failure);
            }
        }
        Ok(())
    }

    /// Resume drivers in bring-up order; every driver is attempted and the
    /// first failure reported
    pub fn resume_all(&self) -> Result<(), DeviceFailure> {
        let mut first = None;
        for driver in self.drivers.lock().iter_mut() {
            if let Err(error) = driver.resume() {
                error!("{}: resume failed: {}", driver.name(), error);
                first.get_or_insert_with(|| DeviceFailure {
                    driver: driver.name().to_string(),
                    error,
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::format;

    struct Fake {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_suspend: bool,
    }

    impl Driver for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&mut self) -> Result<(), DriverError> {
            self.log.lock().push(format!("init {}", self.name));
            Ok(())
        }

        fn suspend(&mut self, _state: PowerState) -> Result<(), DriverError> {
            if self.fail_suspend {
                return Err(DriverError::Busy);
            }
            self.log.lock().push(format!("suspend {}", self.name));
            Ok(())
        }

        fn resume(&mut self) -> Result<(), DriverError> {
            self.log.lock().push(format!("resume {}", self.name));
            Ok(())
        }
    }

    fn manager(fail: &'static str) -> (DeviceManager, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dm = DeviceManager::new();
        for name in ["uart", "spi", "i2c"] {
            dm.register(Box::new(Fake {
                name,
                log: log.clone(),
                fail_suspend: name == fail,
            }));
        }
        (dm, log)
    }

    #[test]
    fn suspend_runs_in_reverse_and_resume_in_order() {
        let (dm, log) = manager("");
        assert_eq!(dm.init_all(), 0);
        dm.suspend_all(PowerState::Suspend).unwrap();
        dm.resume_all().unwrap();
        assert_eq!(
            *log.lock(),
            [
                "init uart", "init spi", "init i2c", "suspend i2c", "suspend spi",
                "suspend uart", "resume uart", "resume spi", "resume i2c",
            ]
        );
    }

    #[test]
    fn failed_suspend_resumes_already_suspended_devices() {
        let (dm, log) = manager("spi");
        let err = dm.suspend_all(PowerState::Shutdown).unwrap_err();
        assert_eq!(
            err,
            DeviceFailure {
                driver: "spi".into(),
                error: DriverError::Busy
            }
        );
        assert_eq!(*log.lock(), ["suspend i2c", "resume i2c"]);
    }
}
