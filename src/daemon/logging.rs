//! Author: [Seclususs](https://github.com/seclususs)

#[cfg(target_os = "android")]
pub fn init() {
    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    android_logger::init_once(
        android_logger::Config::default()
            .with_tag("QoS-Thermal")
            .with_max_level(level),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init() {}
