pub mod layer;
pub mod technique;
