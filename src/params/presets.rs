use std::sync::Arc;
use crate::error::Result;
use crate::params::{CkksParams, CkksParamsBuilder};

/// Parameters sized for 4-way batched MNIST inference.
/// N=2^16, 2^15 slots, 14 fresh levels, bootstraps back to level 12.
/// log(QP) = 58 + 14·42 + 60 = 706 bits, inside the 128-bit bound for N=2^16.
pub fn f16_inference() -> Result<Arc<CkksParams>> {
    CkksParamsBuilder::new()
        .log_degree(16)
        .log_slots(15)
        .max_level(14)
        .bootstrap_level(12)
        .scale_bits(42)
        .base_modulus_bits(58)
        .special_modulus_bits(60)
        .sigma(3.2)
        .bootstrap_precision_bits(24)
        .build()
}

/// Small slot count for fast layer tests. Not secure: the modulus chain
/// is far too long for N=2^13.
pub fn compact_test() -> Result<Arc<CkksParams>> {
    CkksParamsBuilder::new()
        .log_degree(13)
        .log_slots(12)
        .max_level(14)
        .bootstrap_level(12)
        .scale_bits(40)
        .base_modulus_bits(50)
        .special_modulus_bits(50)
        .sigma(3.2)
        .bootstrap_precision_bits(24)
        .build()
}
