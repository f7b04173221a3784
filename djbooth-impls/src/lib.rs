mod players;
mod stores;
mod transports;

pub use players::*;
pub use stores::*;
pub use transports::*;
