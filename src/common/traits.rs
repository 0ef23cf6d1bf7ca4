//! Author: [Seclususs](https://github.com/seclususs)

/// Runtime property source used to resolve per-sensor throttling profiles.
pub trait PropertyReader: Send + Sync {
    fn get_property(&self, key: &str, default_value: &str) -> String;
}

/// Sink for per-sensor cooling device request changes.
pub trait CdevRequestStats {
    fn update_sensor_cdev_request_stats(&mut self, sensor: &str, cdev: &str, state: i32);
}
