pub mod gamma_client;
pub mod types;

pub use gamma_client::{GammaClient, GammaClientError};
pub use types::{GammaEvent, GammaMarket, StreamMessage, WsSubscribe};
