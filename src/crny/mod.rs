//! External-NTP adapter: reflects a running chrony daemon's peer view into
//! the selector and arbitrates ownership of the system clock.

pub mod adapter;
pub mod fsm;
pub mod proto;
