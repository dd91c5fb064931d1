//! Lock-free queue primitives backing each worker's shared cache

mod chain;
mod ring;

pub use chain::Chain;
pub use ring::Ring;
