use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::modbus::executor::ExecutedCommand;

const DEVICE_CHECK_PERIOD: Duration = Duration::from_millis(300);

/// Tracks the last successful bus command and optionally the existence of
/// the serial device file, and signals when the transport should be torn
/// down and reconnected.
#[derive(Debug)]
pub struct Watchdog {
    watch_period: Duration,
    device_path: Option<PathBuf>,
    last_success: Instant,
    last_device_check: Instant,
    last_command_ok: bool,
    device_removed: bool,
}

impl Watchdog {
    pub fn new(watch_period: Duration, device_path: Option<PathBuf>) -> Self {
        log::debug!(
            "watchdog initialized, watch period {}s",
            watch_period.as_secs()
        );
        if let Some(path) = &device_path {
            log::debug!("monitoring {} existence", path.display());
        }
        let now = Instant::now();
        Watchdog {
            watch_period,
            device_path,
            last_success: now,
            last_device_check: now,
            last_command_ok: true,
            device_removed: false,
        }
    }

    pub fn watch_period(&self) -> Duration {
        self.watch_period
    }

    pub fn set_watch_period(&mut self, period: Duration) {
        self.watch_period = period;
    }

    pub fn inspect(&mut self, command: &ExecutedCommand) {
        if command.ok {
            self.reset();
        } else if let Some(path) = &self.device_path {
            // a failing serial command may mean the adapter is gone; check
            // the device node on a fixed cadence to catch unplug fast
            let now = Instant::now();
            if !self.device_removed
                && (self.last_command_ok
                    || now.duration_since(self.last_device_check) > DEVICE_CHECK_PERIOD)
            {
                self.device_removed = !path.exists();
                self.last_device_check = now;
                if self.device_removed {
                    log::debug!("detected removal of {}", path.display());
                }
            }
        }
        self.last_command_ok = command.ok;
    }

    pub fn reset(&mut self) {
        self.last_success = Instant::now();
        self.device_removed = false;
        self.last_command_ok = true;
    }

    pub fn error_period(&self) -> Duration {
        self.last_success.elapsed()
    }

    pub fn is_device_removed(&self) -> bool {
        self.device_removed
    }

    pub fn reconnect_required(&self) -> bool {
        if self.device_removed {
            return true;
        }
        let error_period = self.error_period();
        log::trace!(
            "watchdog: current error period is {}ms",
            error_period.as_millis()
        );
        error_period > self.watch_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(ok: bool) -> ExecutedCommand {
        ExecutedCommand {
            slave_id: 1,
            register: 1,
            is_poll: true,
            ok,
        }
    }

    #[test]
    fn healthy_commands_keep_watchdog_quiet() {
        let mut dog = Watchdog::new(Duration::from_millis(50), None);
        for _ in 0..3 {
            dog.inspect(&command(true));
            assert!(!dog.reconnect_required());
        }
    }

    #[test]
    fn sustained_failure_trips_after_watch_period() {
        let mut dog = Watchdog::new(Duration::from_millis(30), None);
        dog.inspect(&command(false));
        assert!(!dog.reconnect_required());
        std::thread::sleep(Duration::from_millis(40));
        dog.inspect(&command(false));
        assert!(dog.reconnect_required());
    }

    #[test]
    fn success_resets_the_error_period() {
        let mut dog = Watchdog::new(Duration::from_millis(30), None);
        dog.inspect(&command(false));
        std::thread::sleep(Duration::from_millis(20));
        dog.inspect(&command(true));
        std::thread::sleep(Duration::from_millis(20));
        dog.inspect(&command(false));
        assert!(!dog.reconnect_required());
    }

    #[test]
    fn missing_device_forces_reconnect() {
        let mut dog = Watchdog::new(
            Duration::from_secs(60),
            Some(PathBuf::from("/nonexistent/ttyUSB99")),
        );
        dog.inspect(&command(false));
        assert!(dog.is_device_removed());
        assert!(dog.reconnect_required());
    }

    #[test]
    fn present_device_does_not_trip() {
        let mut dog = Watchdog::new(Duration::from_secs(60), Some(PathBuf::from("/")));
        dog.inspect(&command(false));
        assert!(!dog.is_device_removed());
        assert!(!dog.reconnect_required());
    }
}
