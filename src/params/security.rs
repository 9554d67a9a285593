//! RLWE security check against the HomomorphicEncryption.org standard.
//!
//! The standard tabulates, for a ternary secret and σ ≈ 3.2, the largest
//! modulus log2(QP) that still reaches a given classical security level.
//! Degrees above 2^15 are extrapolated linearly, which is what the
//! lattice estimator shows for this regime.

use crate::params::CkksParams;

/// (log2 N, max log QP at 128 / 192 / 256 bits)
const HE_STD_TABLE: &[(u32, [u32; 3])] = &[
    (10, [27, 19, 14]),
    (11, [54, 37, 29]),
    (12, [109, 75, 58]),
    (13, [218, 152, 118]),
    (14, [438, 305, 237]),
    (15, [881, 611, 476]),
];

/// Largest total modulus size (bits) for ring degree 2^log_degree at the given security level.
/// Returns 0 for unsupported levels or tiny rings.
pub fn max_log_q(log_degree: u32, security_bits: u32) -> u32 {
    let column = match security_bits {
        0..=128 => 0,
        129..=192 => 1,
        193..=256 => 2,
        _ => return 0,
    };
    if log_degree < HE_STD_TABLE[0].0 {
        return 0;
    }
    match HE_STD_TABLE.iter().find(|(log_n, _)| *log_n == log_degree) {
        Some((_, bounds)) => bounds[column],
        None => {
            let (last_log_n, bounds) = HE_STD_TABLE[HE_STD_TABLE.len() - 1];
            bounds[column] << (log_degree - last_log_n)
        }
    }
}

/// Check if parameters meet a minimum security level.
pub fn check_security(params: &CkksParams, min_bits: u32) -> bool {
    params.log2_modulus() <= max_log_q(params.log_degree, min_bits)
}

/// Smallest ring degree (log2) whose bound admits `log_qp` bits at `security_bits`.
pub fn min_log_degree(log_qp: u32, security_bits: u32) -> u32 {
    let mut log_n = HE_STD_TABLE[0].0;
    while log_n < 17 {
        if max_log_q(log_n, security_bits) >= log_qp {
            return log_n;
        }
        log_n += 1;
    }
    log_n
}
