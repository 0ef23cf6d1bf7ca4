//! Author: [Seclususs](https://github.com/seclususs)

pub mod cdev_votes;
