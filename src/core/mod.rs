pub mod batch;
pub mod cancel;
pub mod domain;
pub mod gate;
pub mod installer;
pub mod resolver;
pub mod scheduler;
pub mod stats;
pub mod traits;
