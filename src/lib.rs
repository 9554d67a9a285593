//! # fhecnn: encrypted MNIST inference over packed CKKS slots
//!
//! Evaluates a fixed five-layer convolutional classifier on ciphertexts.
//! Tensors are packed into the slots of one ciphertext; convolution,
//! pooling and fully-connected layers become plaintext products and slot
//! rotations, activations become low-degree polynomials, and a level
//! manager inserts bootstraps where the multiplicative budget runs out.
//!
//! Layer code is generic over the [`he::HomEval`] trait. The crate ships
//! [`he::SlotSimulator`], a reference backend that tracks levels, scales and
//! keys like CKKS does and injects comparable noise.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fhecnn::prelude::*;
//!
//! let params = fhecnn::params::presets::f16_inference().unwrap();
//! let model = CnnModel::random(7).unwrap();
//!
//! // Keys for every rotation the network needs, plus a warmed-up bootstrapper.
//! let he = SlotSimulator::new(params, 1);
//! let mut worker = InferenceWorker::new(he, &model, true, SimBootstrapper::new).unwrap();
//!
//! let image = vec![0.5; fhecnn::model::IMAGE_LEN];
//! let prediction = worker.classify(&model, PipelineConfig::default(), &image).unwrap();
//! assert!(prediction.class < 10);
//! ```

pub mod error;
pub mod he;
pub mod io;
pub mod level;
pub mod linear;
pub mod metrics;
pub mod model;
pub mod nonlinear;
pub mod packing;
pub mod params;
pub mod pipeline;
pub mod plain;
pub mod sampling;
pub mod session;

/// Convenient re-exports for common types and functions.
pub mod prelude {
    pub use crate::error::{FheCnnError, Result};
    pub use crate::he::{
        Bootstrapper, EvalKeys, HomEval, KeyGen, RotationKeyTable, SimBootstrapper, SimCiphertext, SimSecretKey,
        SlotSimulator,
    };
    pub use crate::level::{level_align, LevelEvent, LevelManager, LevelState};
    pub use crate::linear::{avg_pool_2x2, conv2d, fc};
    pub use crate::model::{CnnModel, ConvLayer, DenseLayer, TensorShape};
    pub use crate::nonlinear::{gt, one_hot, relu, tournament_max, ReluConfig, ReluDegree};
    pub use crate::packing::{decode_batch, encode_batch, encode_single, SlotLayout};
    pub use crate::params::{CkksParams, CkksParamsBuilder};
    pub use crate::pipeline::{run_parallel, CnnPipeline, InferenceWorker, PipelineConfig, Prediction};
    pub use crate::session::Session;
}
