mod config;
mod playback;
mod queuing;
mod state;
mod store;
mod transport;

pub mod ident;
pub mod util;

pub use config::*;
pub use playback::*;
pub use queuing::*;
pub use state::*;
pub use store::*;
pub use transport::*;
