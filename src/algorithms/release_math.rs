//! Author: [Seclususs](https://github.com/seclususs)

use crate::config::sensor_info::{BindedCdevInfo, ReleaseLogic};

/// Compares measured rail power against the per-severity threshold.
/// `high_power_check` flips the polarity: a rail that is supposed to stay
/// busy counts as over budget when its power drops below the threshold.
pub fn is_over_budget(binded_cdev_info: &BindedCdevInfo, severity_idx: usize, avg_power: f32) -> bool {
    let threshold = binded_cdev_info.power_thresholds[severity_idx];
    let mut over_budget = true;
    if !binded_cdev_info.high_power_check {
        if avg_power < threshold {
            over_budget = false;
        }
    } else if avg_power > threshold {
        over_budget = false;
    }
    over_budget
}

/// Advances a cooling device's release step for one evaluation, clamped to
/// `|release_step| <= max_state`.
pub fn update_release_step(
    release_logic: ReleaseLogic,
    over_budget: bool,
    release_step: i32,
    max_state: i32,
) -> i32 {
    match release_logic {
        ReleaseLogic::Increase => {
            if over_budget {
                0
            } else if release_step.abs() < max_state {
                release_step - 1
            } else {
                release_step
            }
        }
        ReleaseLogic::Decrease => {
            if over_budget {
                0
            } else if release_step < max_state {
                release_step + 1
            } else {
                release_step
            }
        }
        ReleaseLogic::Stepwise => {
            if !over_budget {
                if release_step < max_state {
                    release_step + 1
                } else {
                    release_step
                }
            } else if release_step.abs() < max_state {
                release_step - 1
            } else {
                release_step
            }
        }
        ReleaseLogic::ReleaseToFloor => {
            if over_budget {
                0
            } else {
                max_state
            }
        }
        ReleaseLogic::None => release_step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binded(high_power_check: bool, threshold: f32) -> BindedCdevInfo {
        BindedCdevInfo {
            power_thresholds: [threshold; 7],
            high_power_check,
            ..Default::default()
        }
    }

    #[test]
    fn test_over_budget_polarity() {
        assert!(is_over_budget(&binded(false, 500.0), 2, 500.0));
        assert!(is_over_budget(&binded(false, 500.0), 2, 700.0));
        assert!(!is_over_budget(&binded(false, 500.0), 2, 499.0));

        assert!(is_over_budget(&binded(true, 500.0), 2, 500.0));
        assert!(is_over_budget(&binded(true, 500.0), 2, 300.0));
        assert!(!is_over_budget(&binded(true, 500.0), 2, 501.0));
    }

    #[test]
    fn test_undefined_threshold_counts_as_over_budget() {
        assert!(is_over_budget(&binded(false, f32::NAN), 2, 100.0));
        assert!(is_over_budget(&binded(true, f32::NAN), 2, 100.0));
    }

    #[test]
    fn test_increase_walks_negative_and_snaps_back() {
        let mut step = 0;
        for expected in [-1, -2, -3] {
            step = update_release_step(ReleaseLogic::Increase, false, step, 3);
            assert_eq!(step, expected);
        }
        // Bounded by max_state.
        step = update_release_step(ReleaseLogic::Increase, false, step, 3);
        assert_eq!(step, -3);
        step = update_release_step(ReleaseLogic::Increase, true, step, 3);
        assert_eq!(step, 0);
    }

    #[test]
    fn test_decrease_walks_positive_and_snaps_back() {
        let mut step = 0;
        for expected in [1, 2, 3, 3] {
            step = update_release_step(ReleaseLogic::Decrease, false, step, 3);
            assert_eq!(step, expected);
        }
        step = update_release_step(ReleaseLogic::Decrease, true, step, 3);
        assert_eq!(step, 0);
    }

    #[test]
    fn test_stepwise_walks_both_directions() {
        let mut step = 0;
        step = update_release_step(ReleaseLogic::Stepwise, false, step, 3);
        step = update_release_step(ReleaseLogic::Stepwise, false, step, 3);
        assert_eq!(step, 2);
        step = update_release_step(ReleaseLogic::Stepwise, true, step, 3);
        assert_eq!(step, 1);
        for expected in [0, -1, -2, -3, -3] {
            step = update_release_step(ReleaseLogic::Stepwise, true, step, 3);
            assert_eq!(step, expected);
        }
    }

    #[test]
    fn test_release_to_floor_is_all_or_nothing() {
        assert_eq!(update_release_step(ReleaseLogic::ReleaseToFloor, false, 0, 5), 5);
        assert_eq!(update_release_step(ReleaseLogic::ReleaseToFloor, true, 5, 5), 0);
    }

    #[test]
    fn test_none_leaves_step_untouched() {
        assert_eq!(update_release_step(ReleaseLogic::None, false, 2, 5), 2);
        assert_eq!(update_release_step(ReleaseLogic::None, true, -2, 5), -2);
    }
}
