//! Author: [Seclususs](https://github.com/seclususs)

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Per cooling device, the multiset of current requests from every sensor
/// voting on it. The effective device state is the maximum vote.
#[derive(Debug, Default)]
pub struct CdevVoteRegistry {
    cdev_all_request_map: RwLock<HashMap<String, BTreeMap<i32, usize>>>,
}

impl CdevVoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one vote for `cdev`, creating the entry on first use.
    pub fn insert_request(&self, cdev: &str, state: i32) {
        let mut map = self
            .cdev_all_request_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *map.entry(cdev.to_string())
            .or_default()
            .entry(state)
            .or_insert(0) += 1;
    }

    /// Replaces one sensor's vote and reports whether the aggregated max
    /// request changed. The remove, insert and max comparison happen under
    /// a single write lock so concurrent readers never observe a torn vote.
    pub fn update_request(&self, cdev: &str, cur_request: i32, new_request: i32) -> bool {
        let mut map = self
            .cdev_all_request_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(request_set) = map.get_mut(cdev) else {
            return false;
        };
        let cur_max_request = request_set.keys().next_back().copied();
        if let Some(count) = request_set.get_mut(&cur_request) {
            *count -= 1;
            if *count == 0 {
                request_set.remove(&cur_request);
            }
        }
        *request_set.entry(new_request).or_insert(0) += 1;
        let new_max_request = request_set.keys().next_back().copied();
        log::debug!(
            "For cooling device [{}] cur_max_request is: {:?} new_max_request is: {:?}",
            cdev,
            cur_max_request,
            new_max_request
        );
        new_max_request != cur_max_request
    }

    /// Current maximum vote for `cdev`, or `None` for an unknown device.
    pub fn max_request(&self, cdev: &str) -> Option<i32> {
        let map = self
            .cdev_all_request_map
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.get(cdev)
            .and_then(|request_set| request_set.keys().next_back().copied())
    }
}
