//! Author: [Seclususs](https://github.com/seclususs)

use std::fmt;

#[derive(Debug)]
pub enum ThrottlingError {
    DuplicateSensor(String),
    MissingThrottlingInfo(String),
    UnknownCoolingDevice { sensor: String, cdev: String },
}

impl fmt::Display for ThrottlingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottlingError::DuplicateSensor(s) => {
                write!(f, "Sensor {} throttling map has been registered", s)
            }
            ThrottlingError::MissingThrottlingInfo(s) => {
                write!(f, "Sensor {} has no throttling info", s)
            }
            ThrottlingError::UnknownCoolingDevice { sensor, cdev } => {
                write!(f, "Could not find {}'s binded CDEV {}", sensor, cdev)
            }
        }
    }
}

impl std::error::Error for ThrottlingError {}
