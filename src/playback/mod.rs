//! Playback queue: the pure queue model, the player seam and the engine
//! that ties them together.

pub mod player;
pub mod queue;
pub mod queue_engine;
