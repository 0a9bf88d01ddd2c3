pub mod accumulator;
pub mod bot;
pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod pump;
pub mod stream;
pub mod telemetry;
pub mod transport;
pub mod turn;

pub use bot::Bot;
pub use error::{BotStreamError, CoreResult};
pub use turn::ChatTurn;
