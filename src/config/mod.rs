//! Author: [Seclususs](https://github.com/seclususs)

pub mod cooling_device;
pub mod sensor_info;
