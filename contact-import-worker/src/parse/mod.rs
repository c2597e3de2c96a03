pub mod decoder;
pub mod fields;
pub mod normalize;
