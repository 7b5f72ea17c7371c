pub mod config;
pub mod entity;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod pipeline;
pub mod schema;
pub mod secrets;
pub mod unify;
pub mod write;

pub use config::PipelineConfig;
pub use entity::Entity;
pub use error::{PipelineError, Result};
pub use pipeline::{run, run_entity, RunReport};
