//! Author: [Seclususs](https://github.com/seclususs)

use crate::common::types::ThrottlingSeverity;

use std::collections::HashMap;

/// Mutable per-sensor throttling state. PID memory fields are `None` until
/// the first control tick writes them.
#[derive(Debug, Clone, Default)]
pub struct ThrottlingStatus {
    pub prev_err: Option<f32>,
    pub i_budget: Option<f32>,
    pub prev_target: ThrottlingSeverity,
    pub prev_power_budget: Option<f32>,
    pub budget_transient: f32,
    pub tran_cycle: u32,
    pub profile: String,
    pub pid_power_budget_map: HashMap<String, f32>,
    pub pid_cdev_request_map: HashMap<String, i32>,
    pub hardlimit_cdev_request_map: HashMap<String, i32>,
    pub throttling_release_map: HashMap<String, i32>,
    pub cdev_status_map: HashMap<String, i32>,
}

impl ThrottlingStatus {
    pub fn reset_pid_memory(&mut self) {
        self.prev_err = None;
        self.i_budget = None;
        self.prev_target = ThrottlingSeverity::None;
        self.prev_power_budget = None;
        self.budget_transient = 0.0;
        self.tran_cycle = 0;
    }
}
