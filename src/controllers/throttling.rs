//! Author: [Seclususs](https://github.com/seclususs)

use crate::algorithms::{pid_math, release_math};
use crate::common::error::ThrottlingError;
use crate::common::state::ThrottlingStatus;
use crate::common::traits::{CdevRequestStats, PropertyReader};
use crate::common::types::{Temperature, ThrottlingSeverity};
use crate::config::cooling_device::{CoolingDeviceInfoMap, PowerStatusMap};
use crate::config::sensor_info::{SensorInfo, ThrottlingInfo};
use crate::hal::properties::SystemProperties;
use crate::registry::cdev_votes::CdevVoteRegistry;

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Closed-loop throttling engine. Each registered sensor runs an
/// independent PID/hard-limit/release pipeline per tick; the vote registry
/// aggregates the per-sensor requests into one state per cooling device.
pub struct ThermalThrottling {
    thermal_throttling_status_map: RwLock<HashMap<String, ThrottlingStatus>>,
    cdev_all_request_map: CdevVoteRegistry,
    properties: Box<dyn PropertyReader>,
}

impl Default for ThermalThrottling {
    fn default() -> Self {
        Self::new()
    }
}

impl ThermalThrottling {
    pub fn new() -> Self {
        Self::with_property_reader(Box::new(SystemProperties))
    }

    pub fn with_property_reader(properties: Box<dyn PropertyReader>) -> Self {
        Self {
            thermal_throttling_status_map: RwLock::new(HashMap::new()),
            cdev_all_request_map: CdevVoteRegistry::new(),
            properties,
        }
    }

    /// Registers a sensor for throttling control. The binding maps are
    /// validated up front so a failed registration leaves no partial state.
    pub fn register_thermal_throttling(
        &self,
        sensor_name: &str,
        throttling_info: Option<&ThrottlingInfo>,
        cooling_device_info_map: &CoolingDeviceInfoMap,
    ) -> Result<(), ThrottlingError> {
        let mut status_map = self
            .thermal_throttling_status_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if status_map.contains_key(sensor_name) {
            log::error!("Sensor {} throttling map has been registered", sensor_name);
            return Err(ThrottlingError::DuplicateSensor(sensor_name.to_string()));
        }
        let Some(throttling_info) = throttling_info else {
            log::error!("Sensor {} has no throttling info", sensor_name);
            return Err(ThrottlingError::MissingThrottlingInfo(
                sensor_name.to_string(),
            ));
        };
        for cdev_name in throttling_info.binded_cdev_info_map.keys() {
            if !cooling_device_info_map.contains_key(cdev_name) {
                log::error!("Could not find {}'s binded CDEV {}", sensor_name, cdev_name);
                return Err(ThrottlingError::UnknownCoolingDevice {
                    sensor: sensor_name.to_string(),
                    cdev: cdev_name.clone(),
                });
            }
        }

        let mut status = ThrottlingStatus::default();
        for (cdev_name, binded_cdev_info) in &throttling_info.binded_cdev_info_map {
            let mut vote_holder = false;
            if binded_cdev_info
                .cdev_weight_for_pid
                .iter()
                .any(|weight| !weight.is_nan())
            {
                status
                    .pid_power_budget_map
                    .insert(cdev_name.clone(), f32::MAX);
                status.pid_cdev_request_map.insert(cdev_name.clone(), 0);
                vote_holder = true;
            }
            if binded_cdev_info.limit_info.iter().any(|limit| *limit > 0) {
                status.hardlimit_cdev_request_map.insert(cdev_name.clone(), 0);
                vote_holder = true;
            }
            if binded_cdev_info.power_rail.is_some()
                && binded_cdev_info
                    .power_thresholds
                    .iter()
                    .any(|threshold| !threshold.is_nan())
            {
                status.throttling_release_map.insert(cdev_name.clone(), 0);
                vote_holder = true;
            }
            if vote_holder && status.cdev_status_map.insert(cdev_name.clone(), 0).is_none() {
                self.cdev_all_request_map.insert_request(cdev_name, 0);
            }
        }
        status_map.insert(sensor_name.to_string(), status);
        Ok(())
    }

    /// Resets a sensor's PID memory and drops its demand from every bound
    /// cooling device. Registry entries persist for the process lifetime.
    pub fn clear_throttling_data(&self, sensor_name: &str) {
        let mut status_map = self
            .thermal_throttling_status_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(status) = status_map.get_mut(sensor_name) else {
            return;
        };
        for power_budget in status.pid_power_budget_map.values_mut() {
            *power_budget = f32::MAX;
        }
        for request in status.pid_cdev_request_map.values_mut() {
            *request = 0;
        }
        for request in status.hardlimit_cdev_request_map.values_mut() {
            *request = 0;
        }
        for release_step in status.throttling_release_map.values_mut() {
            *release_step = 0;
        }
        for (cdev_name, current_request) in status.cdev_status_map.iter_mut() {
            if *current_request != 0 {
                self.cdev_all_request_map
                    .update_request(cdev_name, *current_request, 0);
                *current_request = 0;
            }
        }
        status.reset_pid_memory();
    }

    fn parse_profile_property(
        &self,
        sensor_name: &str,
        throttling_info: &ThrottlingInfo,
        status: &mut ThrottlingStatus,
    ) {
        let profile = self
            .properties
            .get_property(&format!("vendor.thermal.{}.profile", sensor_name), "");
        if profile.is_empty() || throttling_info.profile_map.contains_key(&profile) {
            if profile != status.profile {
                log::info!(
                    "{}: throttling profile change to {}",
                    sensor_name,
                    if profile.is_empty() { "default" } else { profile.as_str() }
                );
                status.profile = profile;
            }
        } else {
            log::error!(
                "{}: set profile to default because {} is invalid",
                sensor_name,
                profile
            );
            status.profile.clear();
        }
    }

    /// One control tick for one sensor: PID power budgeting and allocation,
    /// hard-limit lookup and release evaluation. The combined per-device
    /// requests are published separately by [`Self::compute_cooling_devices_request`].
    #[allow(clippy::too_many_arguments)]
    pub fn thermal_throttling_update(
        &self,
        temp: &Temperature,
        sensor_info: &SensorInfo,
        curr_severity: ThrottlingSeverity,
        time_elapsed_ms: u64,
        power_status_map: &PowerStatusMap,
        cooling_device_info_map: &CoolingDeviceInfoMap,
        max_throttling: bool,
        sensor_predictions: &[f32],
    ) {
        let mut status_map = self
            .thermal_throttling_status_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(status) = status_map.get_mut(&temp.name) else {
            return;
        };
        let Some(throttling_info) = sensor_info.throttling_info.as_ref() else {
            return;
        };

        if !throttling_info.profile_map.is_empty() {
            self.parse_profile_property(&temp.name, throttling_info, status);
        }

        if !status.pid_power_budget_map.is_empty() {
            if !self.allocate_power_to_cdev(
                status,
                temp,
                sensor_info,
                curr_severity,
                time_elapsed_ms,
                power_status_map,
                cooling_device_info_map,
                max_throttling,
                sensor_predictions,
            ) {
                log::error!("Sensor {} PID request cdev failed", temp.name);
                // Clear the CDEV request if the power budget failed to be allocated.
                for request in status.pid_cdev_request_map.values_mut() {
                    *request = 0;
                }
            } else {
                update_cdev_request_by_power(status, cooling_device_info_map);
            }
        }

        if !status.hardlimit_cdev_request_map.is_empty() {
            update_cdev_request_by_severity(&temp.name, status, throttling_info, curr_severity);
        }

        if !status.throttling_release_map.is_empty() {
            throttling_release_update(
                &temp.name,
                status,
                throttling_info,
                cooling_device_info_map,
                power_status_map,
                curr_severity,
            );
        }
    }

    // Allocates the sensor power budget to the binded cooling devices based
    // on the measured rail power. The first pass takes devices that already
    // sit at state 0 below their target out of the split; the second pass
    // distributes what is left.
    #[allow(clippy::too_many_arguments)]
    fn allocate_power_to_cdev(
        &self,
        status: &mut ThrottlingStatus,
        temp: &Temperature,
        sensor_info: &SensorInfo,
        curr_severity: ThrottlingSeverity,
        time_elapsed_ms: u64,
        power_status_map: &PowerStatusMap,
        cooling_device_info_map: &CoolingDeviceInfoMap,
        max_throttling: bool,
        sensor_predictions: &[f32],
    ) -> bool {
        let Some(throttling_info) = sensor_info.throttling_info.as_ref() else {
            return false;
        };
        let severity_idx = curr_severity.index();
        let mut total_weight = 0.0f32;
        let mut last_updated_avg_power = f32::NAN;
        let mut allocated_power = 0.0f32;
        let mut allocated_weight = 0.0f32;
        let mut low_power_device_check = true;
        let mut is_budget_allocated = false;
        let mut power_data_invalid = false;
        let mut allocated_cdev: HashSet<&str> = HashSet::new();
        let mut log_buf = String::new();

        let mut total_power_budget = pid_math::update_power_budget(
            temp,
            sensor_info,
            status,
            cooling_device_info_map,
            time_elapsed_ms,
            curr_severity,
            max_throttling,
            sensor_predictions,
            &self.cdev_all_request_map,
        );

        if !throttling_info.excluded_power_info_map.is_empty() {
            total_power_budget -= pid_math::compute_excluded_power(
                throttling_info,
                curr_severity,
                power_status_map,
                &mut log_buf,
            );
            total_power_budget = total_power_budget.max(0.0);
            if !log_buf.is_empty() {
                log::info!(
                    "{} power budget={} after {} is excluded",
                    temp.name,
                    total_power_budget,
                    log_buf
                );
            }
        }

        let binded_cdev_info_map =
            pid_math::active_binded_cdev_map(throttling_info, &status.profile);

        for (cdev_name, binded_cdev_info) in binded_cdev_info_map {
            let cdev_weight = binded_cdev_info.cdev_weight_for_pid[severity_idx];
            if !binded_cdev_info.enabled {
                continue;
            } else if cdev_weight.is_nan() || cdev_weight == 0.0 {
                allocated_cdev.insert(cdev_name.as_str());
                continue;
            }
            total_weight += cdev_weight;
        }

        while !is_budget_allocated {
            for (cdev_name, binded_cdev_info) in binded_cdev_info_map {
                let cdev_weight = binded_cdev_info.cdev_weight_for_pid[severity_idx];
                if allocated_cdev.contains(cdev_name.as_str()) {
                    continue;
                }

                if !power_data_invalid {
                    match binded_cdev_info.power_rail.as_deref() {
                        Some(power_rail) => {
                            last_updated_avg_power = power_status_map
                                .get(power_rail)
                                .map(|power_status| power_status.last_updated_avg_power)
                                .unwrap_or(f32::NAN);
                            if last_updated_avg_power.is_nan() {
                                log::debug!("power data is under collecting");
                                power_data_invalid = true;
                                break;
                            }
                        }
                        None => {
                            power_data_invalid = true;
                            break;
                        }
                    }
                    if binded_cdev_info.throttling_with_power_link {
                        return false;
                    }
                }

                let mut cdev_power_budget = total_power_budget * (cdev_weight / total_weight);
                let cdev_power_adjustment = cdev_power_budget - last_updated_avg_power;

                if low_power_device_check {
                    // Share the budget of the CDEV whose power is already
                    // below target while it sits at min state 0.
                    if cdev_power_adjustment > 0.0
                        && status
                            .pid_cdev_request_map
                            .get(cdev_name)
                            .copied()
                            .unwrap_or(0)
                            == 0
                    {
                        allocated_power += last_updated_avg_power;
                        allocated_weight += cdev_weight;
                        allocated_cdev.insert(cdev_name.as_str());
                        if let Some(power_rail) = binded_cdev_info.power_rail.as_deref() {
                            log_buf.push_str(&format!(
                                "({}: {:.2} mW)",
                                power_rail, last_updated_avg_power
                            ));
                        }
                        log::debug!(
                            "{} binded {} has been already at min state 0",
                            temp.name,
                            cdev_name
                        );
                    }
                } else {
                    let Some(cdev_info) = cooling_device_info_map.get(cdev_name) else {
                        continue;
                    };
                    if let Some(power_rail) = binded_cdev_info.power_rail.as_deref() {
                        log_buf.push_str(&format!(
                            "({}: {:.2} mW)",
                            power_rail, last_updated_avg_power
                        ));
                    }
                    let curr_cdev_vote = status
                        .pid_cdev_request_map
                        .get(cdev_name)
                        .copied()
                        .unwrap_or(0);
                    // Ignore the power distribution if the CDEV has no space
                    // to reduce power.
                    if cdev_power_adjustment < 0.0 && curr_cdev_vote == cdev_info.max_state {
                        log::debug!(
                            "{} binded {} has been already at max state {}",
                            temp.name,
                            cdev_name,
                            cdev_info.max_state
                        );
                        continue;
                    }

                    if !binded_cdev_info.enabled {
                        cdev_power_budget = cdev_info.power_at_state(0);
                    } else if !power_data_invalid && binded_cdev_info.power_rail.is_some() {
                        let cdev_curr_power_budget = status
                            .pid_power_budget_map
                            .get(cdev_name)
                            .copied()
                            .unwrap_or(f32::MAX);
                        if last_updated_avg_power > cdev_curr_power_budget
                            && last_updated_avg_power > 0.0
                        {
                            // Scale the adjustment down when the rail already
                            // runs over its budget to avoid overshooting.
                            cdev_power_budget = cdev_curr_power_budget
                                + cdev_power_adjustment
                                    * (cdev_curr_power_budget / last_updated_avg_power);
                        } else {
                            cdev_power_budget = cdev_curr_power_budget + cdev_power_adjustment;
                        }
                    } else {
                        cdev_power_budget = total_power_budget * (cdev_weight / total_weight);
                    }

                    let max_state_power = cdev_info.power_at_state(0);
                    if !max_state_power.is_nan() && cdev_power_budget > max_state_power {
                        cdev_power_budget = max_state_power;
                    } else if cdev_power_budget < 0.0 {
                        cdev_power_budget = 0.0;
                    }

                    let Some(max_cdev_vote) = self.cdev_all_request_map.max_request(cdev_name)
                    else {
                        return false;
                    };

                    if !max_throttling {
                        if binded_cdev_info.max_release_step != i32::MAX
                            && (power_data_invalid || cdev_power_adjustment > 0.0)
                        {
                            if !power_data_invalid && curr_cdev_vote < max_cdev_vote {
                                // Another sensor still demands more; hold this
                                // sensor's budget at its current state.
                                cdev_power_budget = cdev_info.power_at_state(curr_cdev_vote);
                                log::debug!(
                                    "{}'s {} vote: {} is lower than max cdev vote: {}",
                                    temp.name,
                                    cdev_name,
                                    curr_cdev_vote,
                                    max_cdev_vote
                                );
                            } else {
                                let mut target_release_step = binded_cdev_info.max_release_step;
                                let vote_power = cdev_info
                                    .state2power
                                    .get(curr_cdev_vote as usize)
                                    .copied();
                                // Widen the step across states sharing the
                                // same attainable power.
                                loop {
                                    let stepped_state =
                                        curr_cdev_vote.saturating_sub(target_release_step);
                                    if stepped_state <= binded_cdev_info.limit_info[severity_idx] {
                                        break;
                                    }
                                    let stepped = cdev_info
                                        .state2power
                                        .get(stepped_state as usize)
                                        .copied();
                                    if stepped.is_some() && stepped == vote_power {
                                        target_release_step += 1;
                                    } else {
                                        break;
                                    }
                                }
                                let target_state =
                                    curr_cdev_vote.saturating_sub(target_release_step).max(0);
                                cdev_power_budget = cdev_power_budget
                                    .min(cdev_info.power_at_state(target_state));
                            }
                        }
                        if binded_cdev_info.max_throttle_step != i32::MAX
                            && (power_data_invalid || cdev_power_adjustment < 0.0)
                        {
                            let mut target_throttle_step = binded_cdev_info.max_throttle_step;
                            let vote_power =
                                cdev_info.state2power.get(curr_cdev_vote as usize).copied();
                            loop {
                                let stepped_state =
                                    curr_cdev_vote.saturating_add(target_throttle_step);
                                if stepped_state >= binded_cdev_info.cdev_ceiling[severity_idx] {
                                    break;
                                }
                                let stepped = cdev_info
                                    .state2power
                                    .get(stepped_state as usize)
                                    .copied();
                                if stepped.is_some() && stepped == vote_power {
                                    target_throttle_step += 1;
                                } else {
                                    break;
                                }
                            }
                            let target_state = curr_cdev_vote
                                .saturating_add(target_throttle_step)
                                .min(binded_cdev_info.cdev_ceiling[severity_idx]);
                            cdev_power_budget =
                                cdev_power_budget.max(cdev_info.power_at_state(target_state));
                        }
                    }

                    status
                        .pid_power_budget_map
                        .insert(cdev_name.clone(), cdev_power_budget);
                    log::debug!(
                        "{} allocate {}mW to {} (cdev_weight={})",
                        temp.name,
                        cdev_power_budget,
                        cdev_name,
                        cdev_weight
                    );
                }
            }

            if !power_data_invalid {
                total_power_budget -= allocated_power;
                total_weight -= allocated_weight;
            }
            allocated_power = 0.0;
            allocated_weight = 0.0;

            if low_power_device_check {
                low_power_device_check = false;
            } else {
                is_budget_allocated = true;
            }
        }
        if !log_buf.is_empty() {
            log::info!("{} binded power rails: {}", temp.name, log_buf);
        }
        true
    }

    /// Fuses the PID, hard-limit and release requests per cooling device,
    /// re-votes in the registry and reports the devices whose aggregated max
    /// request changed.
    pub fn compute_cooling_devices_request(
        &self,
        sensor_name: &str,
        sensor_info: &SensorInfo,
        curr_severity: ThrottlingSeverity,
        cooling_devices_to_update: &mut Vec<String>,
        stats: &mut dyn CdevRequestStats,
    ) {
        let mut status_map = self
            .thermal_throttling_status_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(status) = status_map.get_mut(sensor_name) else {
            return;
        };
        let Some(throttling_info) = sensor_info.throttling_info.as_ref() else {
            return;
        };
        let severity_idx = curr_severity.index();
        let binded_cdev_info_map =
            pid_math::active_binded_cdev_map(throttling_info, &status.profile);

        let ThrottlingStatus {
            cdev_status_map,
            pid_cdev_request_map,
            hardlimit_cdev_request_map,
            throttling_release_map,
            ..
        } = status;

        for (cdev_name, current_request) in cdev_status_map.iter_mut() {
            let Some(binded_cdev_info) = binded_cdev_info_map.get(cdev_name) else {
                continue;
            };
            let cdev_ceiling = binded_cdev_info.cdev_ceiling[severity_idx];
            let cdev_floor = binded_cdev_info.cdev_floor_with_power_link[severity_idx];
            let pid_cdev_request = pid_cdev_request_map.get(cdev_name).copied().unwrap_or(0);
            let hardlimit_cdev_request = hardlimit_cdev_request_map
                .get(cdev_name)
                .copied()
                .unwrap_or(0);
            let release_step = throttling_release_map.get(cdev_name).copied().unwrap_or(0);
            log::debug!(
                "{} binded cooling device {}'s pid_request={} hardlimit_cdev_request={} \
                 release_step={} cdev_floor_with_power_link={} cdev_ceiling={}",
                sensor_name,
                cdev_name,
                pid_cdev_request,
                hardlimit_cdev_request,
                release_step,
                cdev_floor,
                cdev_ceiling
            );

            let mut request_state = pid_cdev_request.max(hardlimit_cdev_request);
            if release_step != 0 {
                if release_step >= request_state {
                    request_state = 0;
                } else {
                    request_state -= release_step;
                }
                // Only check the cdev_floor when the release step is non zero.
                request_state = request_state.max(cdev_floor);
            }
            request_state = request_state.min(cdev_ceiling);

            if *current_request != request_state {
                if self
                    .cdev_all_request_map
                    .update_request(cdev_name, *current_request, request_state)
                {
                    cooling_devices_to_update.push(cdev_name.clone());
                }
                *current_request = request_state;
                stats.update_sensor_cdev_request_stats(sensor_name, cdev_name, request_state);
            }
        }
    }

    /// Aggregated maximum request across all sensors voting on `cdev_name`.
    pub fn get_cdev_max_request(&self, cdev_name: &str) -> Option<i32> {
        let request = self.cdev_all_request_map.max_request(cdev_name);
        if request.is_none() {
            log::error!(
                "Cooling device [{}] not present in cooling device request map",
                cdev_name
            );
        }
        request
    }

    /// Snapshot of a sensor's throttling state for inspection.
    pub fn get_throttling_status(&self, sensor_name: &str) -> Option<ThrottlingStatus> {
        let status_map = self
            .thermal_throttling_status_map
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        status_map.get(sensor_name).cloned()
    }
}

/// Maps each allocated per-device budget onto a throttling state request.
fn update_cdev_request_by_power(
    status: &mut ThrottlingStatus,
    cooling_device_info_map: &CoolingDeviceInfoMap,
) {
    let ThrottlingStatus {
        pid_power_budget_map,
        pid_cdev_request_map,
        ..
    } = status;
    for (cdev_name, power_budget) in pid_power_budget_map.iter() {
        let Some(cdev_info) = cooling_device_info_map.get(cdev_name) else {
            continue;
        };
        if let Some(request) = pid_cdev_request_map.get_mut(cdev_name) {
            *request = pid_math::budget_to_cdev_state(cdev_info, *power_budget);
        }
    }
}

/// Table-driven hard limit lookup for the current severity.
fn update_cdev_request_by_severity(
    sensor_name: &str,
    status: &mut ThrottlingStatus,
    throttling_info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
) {
    let binded_cdev_info_map = pid_math::active_binded_cdev_map(throttling_info, &status.profile);
    for (cdev_name, binded_cdev_info) in binded_cdev_info_map {
        let Some(request) = status.hardlimit_cdev_request_map.get_mut(cdev_name) else {
            continue;
        };
        *request = if binded_cdev_info.enabled {
            binded_cdev_info.limit_info[curr_severity.index()]
        } else {
            0
        };
        log::debug!(
            "Hard Limit: Sensor {} update cdev {} to {}",
            sensor_name,
            cdev_name,
            request
        );
    }
}

/// Walks each release-managed device and advances its release step from the
/// measured rail power. Release always evaluates the default binding.
fn throttling_release_update(
    sensor_name: &str,
    status: &mut ThrottlingStatus,
    throttling_info: &ThrottlingInfo,
    cooling_device_info_map: &CoolingDeviceInfoMap,
    power_status_map: &PowerStatusMap,
    curr_severity: ThrottlingSeverity,
) {
    let severity_idx = curr_severity.index();
    for (cdev_name, binded_cdev_info) in &throttling_info.binded_cdev_info_map {
        let Some(release_step) = status.throttling_release_map.get_mut(cdev_name) else {
            continue;
        };
        let Some(cdev_info) = cooling_device_info_map.get(cdev_name) else {
            continue;
        };
        let max_state = cdev_info.max_state;
        let Some(power_rail) = binded_cdev_info.power_rail.as_deref() else {
            continue;
        };
        let Some(power_status) = power_status_map.get(power_rail) else {
            continue;
        };
        let avg_power = power_status.last_updated_avg_power;

        if avg_power.is_nan() || avg_power < 0.0 {
            *release_step = if binded_cdev_info.throttling_with_power_link {
                max_state
            } else {
                0
            };
            continue;
        }

        let over_budget = release_math::is_over_budget(binded_cdev_info, severity_idx, avg_power);
        log::info!(
            "{}'s {} binded power rail {}: power threshold = {}, avg power = {}",
            sensor_name,
            cdev_name,
            power_rail,
            binded_cdev_info.power_thresholds[severity_idx],
            avg_power
        );
        *release_step = release_math::update_release_step(
            binded_cdev_info.release_logic,
            over_budget,
            *release_step,
            max_state,
        );
    }
}
