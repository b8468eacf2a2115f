pub mod align;
pub mod chart;
pub mod images;
pub mod market;
pub mod sentiment;
pub mod window;
