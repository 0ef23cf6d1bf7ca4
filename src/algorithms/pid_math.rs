//! Author: [Seclususs](https://github.com/seclususs)

use crate::common::state::ThrottlingStatus;
use crate::common::types::{Temperature, ThrottlingSeverity};
use crate::config::cooling_device::{CdevInfo, CoolingDeviceInfoMap, PowerStatusMap};
use crate::config::sensor_info::{BindedCdevInfoMap, SensorInfo, ThrottlingInfo};
use crate::registry::cdev_votes::CdevVoteRegistry;

/// Binding set the control loop operates on: the active profile's map when
/// one is selected and defined, the default binding otherwise.
pub fn active_binded_cdev_map<'a>(
    throttling_info: &'a ThrottlingInfo,
    profile: &str,
) -> &'a BindedCdevInfoMap {
    throttling_info
        .profile_map
        .get(profile)
        .unwrap_or(&throttling_info.binded_cdev_info_map)
}

// To find the next PID target state according to the current thermal severity.
// The scan records the last severity with a defined s_power and stops one
// step past the current severity, so the controller regulates against the
// next defined threshold above the one already crossed.
pub fn pid_target_state(
    throttling_info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
) -> usize {
    let mut target_state = 0;
    for severity in ThrottlingSeverity::iter() {
        let state = severity.index();
        if throttling_info.s_power[state].is_nan() {
            continue;
        }
        target_state = state;
        if severity > curr_severity {
            break;
        }
    }
    log::debug!("PID target state = {}", target_state);
    target_state
}

/// Runs one PID iteration and returns the sensor's total power budget in mW.
/// `f32::INFINITY` means no budgeting applies at the current severity.
#[allow(clippy::too_many_arguments)]
pub fn update_power_budget(
    temp: &Temperature,
    sensor_info: &SensorInfo,
    status: &mut ThrottlingStatus,
    cooling_device_info_map: &CoolingDeviceInfoMap,
    time_elapsed_ms: u64,
    curr_severity: ThrottlingSeverity,
    max_throttling: bool,
    sensor_predictions: &[f32],
    registry: &CdevVoteRegistry,
) -> f32 {
    let power_budget = f32::INFINITY;
    if curr_severity == ThrottlingSeverity::None {
        return power_budget;
    }
    let Some(throttling_info) = sensor_info.throttling_info.as_ref() else {
        return power_budget;
    };
    let severity_idx = curr_severity.index();

    // Check the current throttle status over the active binding.
    let mut is_fully_release = true;
    let mut is_fully_throttle = true;
    for (cdev_name, binded_cdev_info) in active_binded_cdev_map(throttling_info, &status.profile) {
        let request = status
            .pid_cdev_request_map
            .get(cdev_name)
            .copied()
            .unwrap_or(0);
        if request > binded_cdev_info.limit_info[severity_idx] {
            is_fully_release = false;
        }
        if request < binded_cdev_info.cdev_ceiling[severity_idx] {
            is_fully_throttle = false;
        }
    }

    let target_state = pid_target_state(throttling_info, curr_severity);
    let mut target_changed = false;
    if status.prev_target != ThrottlingSeverity::None
        && target_state != status.prev_target.index()
        && throttling_info.tran_cycle > 0
    {
        status.tran_cycle = throttling_info.tran_cycle - 1;
        target_changed = true;
    }
    status.prev_target =
        ThrottlingSeverity::from_index(target_state).unwrap_or(ThrottlingSeverity::None);

    let target = sensor_info.hot_thresholds[target_state];
    let err = target - temp.value;

    if max_throttling && err <= 0.0 {
        return throttling_info.min_alloc_power[target_state];
    }

    let p = err
        * if err < 0.0 {
            throttling_info.k_po[target_state]
        } else {
            throttling_info.k_pu[target_state]
        };

    let mut i_budget = match status.i_budget {
        Some(i_budget) => i_budget,
        None => match throttling_info.i_default_pct {
            // Seed the integral from the power the bound devices can still
            // draw at their current aggregated votes.
            Some(i_default_pct) => {
                let mut default_i_budget = 0.0;
                for cdev_name in throttling_info.binded_cdev_info_map.keys() {
                    let Some(cdev_info) = cooling_device_info_map.get(cdev_name) else {
                        continue;
                    };
                    let max_cdev_vote = registry.max_request(cdev_name).unwrap_or(0);
                    default_i_budget += cdev_info.power_at_state(max_cdev_vote);
                }
                default_i_budget * i_default_pct / 100.0
            }
            None => throttling_info.i_default,
        },
    };

    if err < throttling_info.i_cutoff[target_state] {
        let prev_power_budget = status.prev_power_budget;
        if err < 0.0
            && prev_power_budget.is_some_and(|prev| prev > throttling_info.min_alloc_power[target_state])
            && !is_fully_throttle
        {
            i_budget += err * throttling_info.k_io[target_state];
        } else if err > 0.0
            && prev_power_budget.is_some_and(|prev| prev < throttling_info.max_alloc_power[target_state])
            && !is_fully_release
        {
            i_budget += err * throttling_info.k_iu[target_state];
        }
    }
    if i_budget.abs() > throttling_info.i_max[target_state] {
        i_budget = throttling_info.i_max[target_state] * if i_budget > 0.0 { 1.0 } else { -1.0 };
    }
    status.i_budget = Some(i_budget);

    let mut d = 0.0;
    if let Some(prev_err) = status.prev_err {
        if time_elapsed_ms != 0 {
            d = throttling_info.k_d[target_state] * (err - prev_err) / time_elapsed_ms as f32;
        }
    }

    let mut compensation = 0.0;
    if let Some(predictor_info) = sensor_info.predictor_info.as_ref() {
        if predictor_info.support_pid_compensation {
            for (i, prediction) in sensor_predictions.iter().enumerate() {
                let prediction_err = target - prediction * sensor_info.multiplier;
                compensation += predictor_info
                    .prediction_weights
                    .get(i)
                    .copied()
                    .unwrap_or(0.0)
                    * prediction_err;
            }
            // Weight by the current control target.
            compensation *= predictor_info.k_p_compensate[target_state];
        }
    }

    status.prev_err = Some(err);
    let mut power_budget = throttling_info.s_power[target_state] + p + i_budget + d + compensation;
    power_budget = power_budget.clamp(
        throttling_info.min_alloc_power[target_state],
        throttling_info.max_alloc_power[target_state],
    );

    if target_changed {
        status.budget_transient = status.prev_power_budget.unwrap_or(power_budget) - power_budget;
    }
    let mut budget_transient = 0.0;
    if status.tran_cycle > 0 {
        budget_transient =
            status.budget_transient * (status.tran_cycle as f32 / throttling_info.tran_cycle as f32);
        power_budget += budget_transient;
        status.tran_cycle -= 1;
    }

    log::info!(
        "{} power_budget={} err={} s_power={} time_elapsed_ms={} p={} i={} d={} \
         compensation={} budget_transient={} control_target={}",
        temp.name,
        power_budget,
        err,
        throttling_info.s_power[target_state],
        time_elapsed_ms,
        p,
        i_budget,
        d,
        compensation,
        budget_transient,
        target_state
    );

    status.prev_power_budget = Some(power_budget);
    power_budget
}

/// Sum of measured rail power to subtract from the sensor budget, weighted
/// per severity. Rails still collecting their first window are skipped.
pub fn compute_excluded_power(
    throttling_info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
    power_status_map: &PowerStatusMap,
    log_buf: &mut String,
) -> f32 {
    let mut excluded_power = 0.0;
    for (rail, weights) in &throttling_info.excluded_power_info_map {
        let Some(power_status) = power_status_map.get(rail) else {
            continue;
        };
        let last_updated_avg_power = power_status.last_updated_avg_power;
        if !last_updated_avg_power.is_nan() {
            let weight = weights[curr_severity.index()];
            excluded_power += last_updated_avg_power * weight;
            log_buf.push_str(&format!(
                "({}: {:.2} mW, cdev_weight: {})",
                rail, last_updated_avg_power, weight
            ));
        }
    }
    excluded_power
}

/// Maps an allocated power budget onto the lowest throttling state whose
/// attainable power fits under it, falling through to the deepest state.
pub fn budget_to_cdev_state(cdev_info: &CdevInfo, power_budget: f32) -> i32 {
    let mut state = 0;
    while state + 1 < cdev_info.state2power.len() {
        if power_budget >= cdev_info.state2power[state] {
            break;
        }
        state += 1;
    }
    state as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAN7: [f32; 7] = [f32::NAN; 7];

    fn moderate_sensor() -> SensorInfo {
        let mut throttling_info = ThrottlingInfo {
            i_max: [f32::MAX; 7],
            max_alloc_power: [f32::MAX; 7],
            min_alloc_power: [0.0; 7],
            s_power: NAN7,
            i_cutoff: [f32::MAX; 7],
            ..Default::default()
        };
        throttling_info.s_power[2] = 1000.0;
        throttling_info.k_po[2] = -100.0;
        throttling_info
            .binded_cdev_info_map
            .insert("fan".to_string(), Default::default());
        let mut hot_thresholds = NAN7;
        hot_thresholds[2] = 45.0;
        SensorInfo {
            hot_thresholds,
            throttling_info: Some(throttling_info),
            ..Default::default()
        }
    }

    fn run_tick(sensor_info: &SensorInfo, status: &mut ThrottlingStatus, value: f32) -> f32 {
        let temp = Temperature {
            name: "skin".to_string(),
            value,
        };
        update_power_budget(
            &temp,
            sensor_info,
            status,
            &CoolingDeviceInfoMap::new(),
            100,
            ThrottlingSeverity::Moderate,
            false,
            &[],
            &CdevVoteRegistry::new(),
        )
    }

    #[test]
    fn test_severity_none_returns_unbounded_budget() {
        let sensor_info = moderate_sensor();
        let mut status = ThrottlingStatus::default();
        let temp = Temperature {
            name: "skin".to_string(),
            value: 30.0,
        };
        let budget = update_power_budget(
            &temp,
            &sensor_info,
            &mut status,
            &CoolingDeviceInfoMap::new(),
            100,
            ThrottlingSeverity::None,
            false,
            &[],
            &CdevVoteRegistry::new(),
        );
        assert!(budget.is_infinite() && budget > 0.0);
        assert!(status.prev_err.is_none(), "no PID memory at severity NONE");
    }

    #[test]
    fn test_target_state_tracks_last_defined_severity() {
        let mut throttling_info = ThrottlingInfo::default();
        throttling_info.s_power[2] = 1000.0;
        assert_eq!(
            pid_target_state(&throttling_info, ThrottlingSeverity::Moderate),
            2
        );
        assert_eq!(
            pid_target_state(&throttling_info, ThrottlingSeverity::Shutdown),
            2
        );
    }

    #[test]
    fn test_target_state_overshoots_to_next_defined_severity() {
        let mut throttling_info = ThrottlingInfo::default();
        throttling_info.s_power[1] = 500.0;
        throttling_info.s_power[3] = 1200.0;
        // At LIGHT the scan records SEVERE before it stops, so the loop
        // regulates against the next threshold the sensor could cross.
        assert_eq!(
            pid_target_state(&throttling_info, ThrottlingSeverity::Light),
            3
        );
        assert_eq!(
            pid_target_state(&throttling_info, ThrottlingSeverity::Severe),
            3
        );
        assert_eq!(
            pid_target_state(&throttling_info, ThrottlingSeverity::None),
            1
        );
    }

    #[test]
    fn test_proportional_budget_above_setpoint() {
        let sensor_info = moderate_sensor();
        let mut status = ThrottlingStatus::default();
        // err = 45 - 50 = -5, p = -5 * -100 = 500.
        let budget = run_tick(&sensor_info, &mut status, 50.0);
        assert_eq!(budget, 1500.0);
        assert_eq!(status.prev_err, Some(-5.0));
        assert_eq!(status.prev_power_budget, Some(1500.0));
    }

    #[test]
    fn test_max_throttling_shortcuts_to_min_alloc_power() {
        let mut sensor_info = moderate_sensor();
        sensor_info.throttling_info.as_mut().unwrap().min_alloc_power[2] = 200.0;
        let mut status = ThrottlingStatus::default();
        let temp = Temperature {
            name: "skin".to_string(),
            value: 50.0,
        };
        let budget = update_power_budget(
            &temp,
            &sensor_info,
            &mut status,
            &CoolingDeviceInfoMap::new(),
            100,
            ThrottlingSeverity::Moderate,
            true,
            &[],
            &CdevVoteRegistry::new(),
        );
        assert_eq!(budget, 200.0);
        assert!(status.prev_power_budget.is_none());
    }

    #[test]
    fn test_integral_does_not_wind_up_at_min_alloc_power() {
        let mut sensor_info = moderate_sensor();
        {
            let throttling_info = sensor_info.throttling_info.as_mut().unwrap();
            throttling_info.min_alloc_power[2] = 2000.0;
            throttling_info.max_alloc_power[2] = 5000.0;
            throttling_info.k_io[2] = 30.0;
        }
        let mut status = ThrottlingStatus::default();
        for _ in 0..100 {
            let budget = run_tick(&sensor_info, &mut status, 50.0);
            assert_eq!(budget, 2000.0, "budget clamps to min_alloc_power");
            assert_eq!(status.i_budget, Some(0.0), "integral must not accumulate");
        }
    }

    #[test]
    fn test_integral_clamps_to_i_max() {
        let mut sensor_info = moderate_sensor();
        {
            let throttling_info = sensor_info.throttling_info.as_mut().unwrap();
            throttling_info.k_iu[2] = 100.0;
            throttling_info.i_max[2] = 250.0;
            throttling_info.max_alloc_power[2] = 100_000.0;
        }
        let mut status = ThrottlingStatus::default();
        // A nonzero request keeps the sensor out of the fully-released state
        // so upward integral accumulation is allowed.
        status.pid_cdev_request_map.insert("fan".to_string(), 1);
        // err = +5 each tick, i accumulates 500/tick but clamps at 250.
        run_tick(&sensor_info, &mut status, 40.0);
        run_tick(&sensor_info, &mut status, 40.0);
        let i_budget = status.i_budget.unwrap();
        assert_eq!(i_budget, 250.0);
    }

    #[test]
    fn test_integral_seed_from_default_pct() {
        let mut sensor_info = moderate_sensor();
        {
            let throttling_info = sensor_info.throttling_info.as_mut().unwrap();
            throttling_info.k_po[2] = 0.0;
            throttling_info.s_power[2] = 0.0;
            throttling_info.i_default_pct = Some(50.0);
            throttling_info
                .binded_cdev_info_map
                .insert("gpu".to_string(), Default::default());
        }
        let mut cdev_map = CoolingDeviceInfoMap::new();
        cdev_map.insert(
            "fan".to_string(),
            CdevInfo {
                state2power: vec![2000.0, 1000.0, 500.0],
                max_state: 2,
            },
        );
        cdev_map.insert(
            "gpu".to_string(),
            CdevInfo {
                state2power: vec![4000.0, 1000.0],
                max_state: 1,
            },
        );
        let registry = CdevVoteRegistry::new();
        registry.insert_request("fan", 1);
        registry.insert_request("gpu", 0);
        let mut status = ThrottlingStatus::default();
        let temp = Temperature {
            name: "skin".to_string(),
            value: 45.0,
        };
        let budget = update_power_budget(
            &temp,
            &sensor_info,
            &mut status,
            &cdev_map,
            100,
            ThrottlingSeverity::Moderate,
            false,
            &[],
            &registry,
        );
        // (1000 + 4000) * 50% seeds the integral; everything else is zero.
        assert_eq!(status.i_budget, Some(2500.0));
        assert_eq!(budget, 2500.0);
    }

    #[test]
    fn test_target_change_blends_transient_budget() {
        let mut throttling_info = ThrottlingInfo {
            s_power: NAN7,
            tran_cycle: 4,
            ..Default::default()
        };
        throttling_info.s_power[1] = 500.0;
        throttling_info.s_power[2] = 800.0;
        throttling_info.s_power[3] = 1200.0;
        let mut hot_thresholds = NAN7;
        hot_thresholds[1] = 40.0;
        hot_thresholds[2] = 45.0;
        hot_thresholds[3] = 50.0;
        let sensor_info = SensorInfo {
            hot_thresholds,
            throttling_info: Some(throttling_info),
            ..Default::default()
        };
        let mut status = ThrottlingStatus::default();
        let run = |status: &mut ThrottlingStatus, severity, value| {
            let temp = Temperature {
                name: "skin".to_string(),
                value,
            };
            update_power_budget(
                &temp,
                &sensor_info,
                status,
                &CoolingDeviceInfoMap::new(),
                100,
                severity,
                false,
                &[],
                &CdevVoteRegistry::new(),
            )
        };
        // LIGHT regulates against the MODERATE threshold.
        assert_eq!(run(&mut status, ThrottlingSeverity::Light, 45.0), 800.0);
        // Jump to SEVERE: transient = 800 - 1200 = -400, blended over 3 cycles.
        assert_eq!(run(&mut status, ThrottlingSeverity::Severe, 50.0), 900.0);
        assert_eq!(run(&mut status, ThrottlingSeverity::Severe, 50.0), 1000.0);
        assert_eq!(run(&mut status, ThrottlingSeverity::Severe, 50.0), 1100.0);
        assert_eq!(run(&mut status, ThrottlingSeverity::Severe, 50.0), 1200.0);
    }

    #[test]
    fn test_prediction_compensation_adds_weighted_error() {
        let mut sensor_info = moderate_sensor();
        sensor_info.multiplier = 1.0;
        sensor_info.predictor_info = Some(crate::config::sensor_info::PredictorInfo {
            support_pid_compensation: true,
            prediction_weights: vec![0.5, 0.25],
            k_p_compensate: {
                let mut k = [0.0; 7];
                k[2] = 2.0;
                k
            },
        });
        let mut status = ThrottlingStatus::default();
        let temp = Temperature {
            name: "skin".to_string(),
            value: 45.0,
        };
        // predictions 47 and 49 against target 45:
        // comp = 2 * (0.5 * -2 + 0.25 * -4) = -4.
        let budget = update_power_budget(
            &temp,
            &sensor_info,
            &mut status,
            &CoolingDeviceInfoMap::new(),
            100,
            ThrottlingSeverity::Moderate,
            false,
            &[47.0, 49.0],
            &CdevVoteRegistry::new(),
        );
        assert_eq!(budget, 996.0);
    }

    #[test]
    fn test_derivative_needs_elapsed_time() {
        let mut sensor_info = moderate_sensor();
        {
            let throttling_info = sensor_info.throttling_info.as_mut().unwrap();
            throttling_info.k_po[2] = 0.0;
            throttling_info.k_d[2] = 100.0;
        }
        let mut status = ThrottlingStatus::default();
        assert_eq!(run_tick(&sensor_info, &mut status, 47.0), 1000.0);
        // err moves -2 -> -1, d = 100 * 1 / 100ms = 1.
        assert_eq!(run_tick(&sensor_info, &mut status, 46.0), 1001.0);
        // Zero elapsed time suppresses the derivative term.
        let temp = Temperature {
            name: "skin".to_string(),
            value: 45.0,
        };
        let budget = update_power_budget(
            &temp,
            &sensor_info,
            &mut status,
            &CoolingDeviceInfoMap::new(),
            0,
            ThrottlingSeverity::Moderate,
            false,
            &[],
            &CdevVoteRegistry::new(),
        );
        assert_eq!(budget, 1000.0);
    }

    #[test]
    fn test_excluded_power_skips_collecting_rails() {
        let mut throttling_info = ThrottlingInfo::default();
        let mut weights = [0.0; 7];
        weights[2] = 2.0;
        throttling_info
            .excluded_power_info_map
            .insert("rail_a".to_string(), weights);
        throttling_info
            .excluded_power_info_map
            .insert("rail_b".to_string(), weights);
        let mut power_status_map = PowerStatusMap::new();
        power_status_map.insert(
            "rail_a".to_string(),
            crate::config::cooling_device::PowerStatus {
                last_updated_avg_power: 100.0,
            },
        );
        power_status_map.insert(
            "rail_b".to_string(),
            crate::config::cooling_device::PowerStatus {
                last_updated_avg_power: f32::NAN,
            },
        );
        let mut log_buf = String::new();
        let excluded = compute_excluded_power(
            &throttling_info,
            ThrottlingSeverity::Moderate,
            &power_status_map,
            &mut log_buf,
        );
        assert_eq!(excluded, 200.0);
        assert!(log_buf.contains("rail_a"));
        assert!(!log_buf.contains("rail_b"));
    }

    #[test]
    fn test_budget_to_cdev_state_picks_first_fitting_state() {
        let cdev_info = CdevInfo {
            state2power: vec![2000.0, 1500.0, 1000.0, 500.0, 0.0],
            max_state: 4,
        };
        assert_eq!(budget_to_cdev_state(&cdev_info, 2500.0), 0);
        assert_eq!(budget_to_cdev_state(&cdev_info, 1500.0), 1);
        assert_eq!(budget_to_cdev_state(&cdev_info, 1200.0), 2);
        assert_eq!(budget_to_cdev_state(&cdev_info, 100.0), 4);

        // state2power[state] <= budget < state2power[state - 1] where defined.
        for budget in [0.0, 250.0, 600.0, 999.0, 1750.0, 3000.0] {
            let state = budget_to_cdev_state(&cdev_info, budget) as usize;
            assert!(cdev_info.state2power[state] <= budget || state == 4);
            if state > 0 {
                assert!(cdev_info.state2power[state - 1] > budget);
            }
        }
    }
}
