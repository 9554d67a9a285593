//! Linear layers over packed slots: convolution, pooling, fully-connected.

pub mod conv;
pub mod fc;
pub mod pool;

pub use conv::conv2d;
pub use fc::{bsgs_split, fc, rotate_and_sum};
pub use pool::avg_pool_2x2;
