pub mod settlement;
pub mod streamer;
