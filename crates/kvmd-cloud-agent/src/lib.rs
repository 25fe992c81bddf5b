//! kvmd-cloud Agent Library
//!
//! Core functionality for the agent:
//! - Guard supervising the hive and proxy links with reconnection
//! - Events channel protocol shared by both links
//! - Virtual connection forwarding to local TCP and Unix sockets
//! - Local control socket exposing status and DNS record forwarding

pub mod ctl;
pub mod tunnel;
