pub mod checkpoint;
pub mod infer;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod train;
