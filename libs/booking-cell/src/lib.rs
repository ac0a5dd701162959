pub mod clock;
pub mod error;
pub mod models;
pub mod services;

pub use clock::*;
pub use error::*;
pub use models::*;
pub use services::*;

pub use shared_models::{Actor, ActorRole, SYSTEM_ACTOR_ID};
