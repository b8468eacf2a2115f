pub mod split;
pub mod trainer;
