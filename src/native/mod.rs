/// Native module contains implementations of core traits that talk to the
/// operating system directly, spawning real child processes.
pub mod executor;
pub mod launcher;
