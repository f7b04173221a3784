mod loopback;

pub use loopback::*;
