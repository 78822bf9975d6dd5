#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod aggregate;
pub mod assumptions;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod partition;
pub mod pipeline;
pub mod visualize;

#[path = "../model/lib.rs"]
pub mod model;
