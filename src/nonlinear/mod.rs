//! Polynomial approximations of the non-linear steps.

pub mod compare;
pub mod relu;

pub use compare::{gt, one_hot, tournament_max};
pub use relu::{relu, ReluConfig, ReluDegree};
