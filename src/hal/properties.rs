//! Author: [Seclususs](https://github.com/seclususs)

use crate::common::traits::PropertyReader;

#[cfg(target_os = "android")]
const PROP_VALUE_MAX: usize = 92;

#[cfg(target_os = "android")]
extern "C" {
    fn __system_property_get(name: *const libc::c_char, value: *mut libc::c_char) -> libc::c_int;
}

#[cfg(target_os = "android")]
pub fn get_system_property(key: &str, default_value: &str) -> String {
    let Ok(c_key) = std::ffi::CString::new(key) else {
        return default_value.to_string();
    };
    let mut buffer = [0u8; PROP_VALUE_MAX];
    let len = unsafe { __system_property_get(c_key.as_ptr(), buffer.as_mut_ptr().cast()) };
    if len <= 0 {
        return default_value.to_string();
    }
    let value = unsafe { std::ffi::CStr::from_ptr(buffer.as_ptr().cast()) };
    value.to_string_lossy().into_owned()
}

#[cfg(not(target_os = "android"))]
pub fn get_system_property(key: &str, default_value: &str) -> String {
    let _ = key;
    default_value.to_string()
}

/// Android system property backend for profile resolution.
pub struct SystemProperties;

impl PropertyReader for SystemProperties {
    fn get_property(&self, key: &str, default_value: &str) -> String {
        get_system_property(key, default_value)
    }
}
