pub mod encoder;
pub mod fusion;
pub mod layers;
pub mod optimizer;
pub mod persistence;
