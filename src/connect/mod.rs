//! Connections and the machinery that finds, pools, and drives them.

mod codec;
mod connection;
mod exchange;
mod finder;
mod pool;

pub use codec::{CodecFactory, ExchangeCodec, UnconfiguredCodecFactory};
pub use connection::RealConnection;
pub use exchange::Exchange;
pub use finder::ExchangeFinder;
pub use pool::ConnectionPool;
