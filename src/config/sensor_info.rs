//! Author: [Seclususs](https://github.com/seclususs)

use crate::common::types::{SeverityArray, SeverityStates, ThrottlingSeverity};

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseLogic {
    None,
    Increase,
    Decrease,
    Stepwise,
    ReleaseToFloor,
}

/// Per (sensor, cooling device) binding. Per-severity tables use NaN for
/// "not applicable at this severity"; `max_throttle_step`/`max_release_step`
/// use `i32::MAX` for "uncapped".
#[derive(Debug, Clone)]
pub struct BindedCdevInfo {
    pub cdev_weight_for_pid: SeverityArray,
    pub limit_info: SeverityStates,
    pub power_thresholds: SeverityArray,
    pub release_logic: ReleaseLogic,
    pub high_power_check: bool,
    pub throttling_with_power_link: bool,
    pub cdev_ceiling: SeverityStates,
    pub cdev_floor_with_power_link: SeverityStates,
    pub power_rail: Option<String>,
    pub max_throttle_step: i32,
    pub max_release_step: i32,
    pub enabled: bool,
}

impl Default for BindedCdevInfo {
    fn default() -> Self {
        Self {
            cdev_weight_for_pid: [f32::NAN; ThrottlingSeverity::COUNT],
            limit_info: [0; ThrottlingSeverity::COUNT],
            power_thresholds: [f32::NAN; ThrottlingSeverity::COUNT],
            release_logic: ReleaseLogic::None,
            high_power_check: false,
            throttling_with_power_link: false,
            cdev_ceiling: [i32::MAX; ThrottlingSeverity::COUNT],
            cdev_floor_with_power_link: [0; ThrottlingSeverity::COUNT],
            power_rail: None,
            max_throttle_step: i32::MAX,
            max_release_step: i32::MAX,
            enabled: true,
        }
    }
}

pub type BindedCdevInfoMap = HashMap<String, BindedCdevInfo>;

#[derive(Debug, Clone)]
pub struct ThrottlingInfo {
    pub k_po: SeverityArray,
    pub k_pu: SeverityArray,
    pub k_io: SeverityArray,
    pub k_iu: SeverityArray,
    pub k_d: SeverityArray,
    pub i_max: SeverityArray,
    pub max_alloc_power: SeverityArray,
    pub min_alloc_power: SeverityArray,
    pub s_power: SeverityArray,
    pub i_cutoff: SeverityArray,
    pub i_default: f32,
    pub i_default_pct: Option<f32>,
    pub tran_cycle: u32,
    pub excluded_power_info_map: HashMap<String, SeverityArray>,
    pub binded_cdev_info_map: BindedCdevInfoMap,
    pub profile_map: HashMap<String, BindedCdevInfoMap>,
}

impl Default for ThrottlingInfo {
    fn default() -> Self {
        Self {
            k_po: [0.0; ThrottlingSeverity::COUNT],
            k_pu: [0.0; ThrottlingSeverity::COUNT],
            k_io: [0.0; ThrottlingSeverity::COUNT],
            k_iu: [0.0; ThrottlingSeverity::COUNT],
            k_d: [0.0; ThrottlingSeverity::COUNT],
            i_max: [f32::MAX; ThrottlingSeverity::COUNT],
            max_alloc_power: [f32::MAX; ThrottlingSeverity::COUNT],
            min_alloc_power: [0.0; ThrottlingSeverity::COUNT],
            s_power: [f32::NAN; ThrottlingSeverity::COUNT],
            i_cutoff: [f32::MAX; ThrottlingSeverity::COUNT],
            i_default: 0.0,
            i_default_pct: None,
            tran_cycle: 0,
            excluded_power_info_map: HashMap::new(),
            binded_cdev_info_map: HashMap::new(),
            profile_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictorInfo {
    pub support_pid_compensation: bool,
    pub prediction_weights: Vec<f32>,
    pub k_p_compensate: SeverityArray,
}

/// Read-only sensor configuration, frozen at registration time.
#[derive(Debug, Clone)]
pub struct SensorInfo {
    pub hot_thresholds: SeverityArray,
    pub multiplier: f32,
    pub predictor_info: Option<PredictorInfo>,
    pub throttling_info: Option<ThrottlingInfo>,
}

impl Default for SensorInfo {
    fn default() -> Self {
        Self {
            hot_thresholds: [f32::NAN; ThrottlingSeverity::COUNT],
            multiplier: 1.0,
            predictor_info: None,
            throttling_info: None,
        }
    }
}
