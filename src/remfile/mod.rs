//! Remote-file RPC (spec.md §4.8): wire format, client `do_request`, and
//! the server dispatcher.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{do_request, NodeVisibility};
pub use server::{dispatch, FileLayer};
pub use wire::{Request, Response, ServerOp};
