//! Author: [Seclususs](https://github.com/seclususs)

use std::collections::HashMap;

/// Static cooling device description. `state2power` is monotonically
/// non-increasing over states.
#[derive(Debug, Clone)]
pub struct CdevInfo {
    pub state2power: Vec<f32>,
    pub max_state: i32,
}

impl CdevInfo {
    /// Power attainable at `state`, clamped into the table range.
    pub fn power_at_state(&self, state: i32) -> f32 {
        if self.state2power.is_empty() {
            return f32::NAN;
        }
        let index = state.clamp(0, self.state2power.len() as i32 - 1) as usize;
        self.state2power[index]
    }
}

/// Last averaged rail power published by the energy counter reader.
/// NaN while the first averaging window is still being collected.
#[derive(Debug, Clone, Copy)]
pub struct PowerStatus {
    pub last_updated_avg_power: f32,
}

pub type CoolingDeviceInfoMap = HashMap<String, CdevInfo>;
pub type PowerStatusMap = HashMap<String, PowerStatus>;
