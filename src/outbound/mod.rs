//! Outbound dialers: the encrypted tunnel and the direct bypass path.

pub mod direct;
pub mod shadowsocks;

pub use direct::dial_direct;
pub use shadowsocks::{ShadowsocksConnection, ShadowsocksOutbound};
