//! Gateway core: credential scheduling, per-credential locking and slot
//! accounting, the generation pipeline, and the local artifact cache.

pub mod bootstrap;
pub mod cache;
pub mod limiter;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod token_lock;
pub mod workers;

pub use cache::{FileCache, MediaType};
pub use limiter::ConcurrencyLimiter;
pub use models::{ModelKind, ModelSpec, all_models, find_model};
pub use pipeline::{GenerationRequest, StreamEvent, availability_message, run_generation};
pub use scheduler::{Scheduler, SelectRequest};
pub use state::AppState;
pub use token_lock::TokenLock;
