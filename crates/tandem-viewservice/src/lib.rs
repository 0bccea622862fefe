//! # tandem-viewservice: View assignment for `tandem`
//!
//! The view service is the single authority on who is primary and who is
//! backup. It is deliberately small:
//!
//! - [`ViewService`]: pure state machine handling joins and failure reports
//! - [`ViewServiceServer`]: answers request datagrams on a `mio` UDP socket
//! - [`ViewServiceClient`]: blocking client with bounded resend
//!
//! The service is not replicated; if it is down, nodes keep serving their
//! current view but no reconfiguration can happen.

mod client;
mod error;
mod server;
mod service;

pub use client::{ClientOptions, ViewServiceClient};
pub use error::{ViewServiceError, ViewServiceResult};
pub use server::{ShutdownHandle, ViewServiceServer};
pub use service::ViewService;
