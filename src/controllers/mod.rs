//! Author: [Seclususs](https://github.com/seclususs)

pub mod throttling;
