#![deny(dead_code)]
#![deny(unused_imports)]

pub mod construction;
pub mod estimate;
pub mod fitted;
pub mod irls;
pub mod selection;
pub mod terms;
