pub mod gaussian;

pub use gaussian::{add_gaussian_noise, quantize, sample_gaussian};
