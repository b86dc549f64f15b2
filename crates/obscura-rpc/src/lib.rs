//! obscura-rpc
//!
//! JSON-RPC 2.0 surface: the public session API (create/observe/cancel/
//! currencies) plus the operator endpoints for alerts, status, and
//! maintenance mode. Session views expose coarse status only — internal
//! failure detail never crosses this boundary.

pub mod api;
pub mod server;
pub mod types;

pub use api::ObscuraApiServer;
pub use server::{RpcServer, RpcServerState};
pub use types::*;
