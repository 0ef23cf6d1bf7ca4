//! This file is part of QoS-Thermal.
//! Licensed under the GNU GPL v3 or later.

pub mod algorithms;
pub mod common;
pub mod config;
pub mod controllers;
pub mod daemon;
pub mod hal;
pub mod registry;

pub use common::error::ThrottlingError;
pub use common::state::ThrottlingStatus;
pub use common::traits::{CdevRequestStats, PropertyReader};
pub use common::types::{Temperature, ThrottlingSeverity};
pub use config::cooling_device::{CdevInfo, CoolingDeviceInfoMap, PowerStatus, PowerStatusMap};
pub use config::sensor_info::{
    BindedCdevInfo, BindedCdevInfoMap, PredictorInfo, ReleaseLogic, SensorInfo, ThrottlingInfo,
};
pub use controllers::throttling::ThermalThrottling;
pub use registry::cdev_votes::CdevVoteRegistry;
