//! reqbouncer: hijack and bounce public HTTP requests to a server behind NAT.
//!
//! A public rendezvous server ([`server`]) accepts agents over outbound
//! WebSockets and steers public requests for a subdomain through the
//! matching agent ([`client`]), which replays them against a local target
//! and returns the raw response bytes over the same socket ([`wire`]).

pub mod broker;
pub mod client;
pub mod github;
pub mod host;
pub mod server;
pub mod wire;
