//! telebus is a client-side Rust binding layer for the Telepathy IM/VoIP
//! framework: typed proxies for connections, channels, accounts and channel
//! dispatch operations, driven by an asynchronous feature-readiness engine,
//! plus a registrar that exports Observer/Approver/Handler clients for the
//! channel dispatcher to call.
//!
//! Proxies start introspecting themselves the moment they are constructed.
//! Callers declare which optional [`Feature`]s they need and await
//! [`PendingReady`]; the readiness engine batches concurrent requests,
//! honors feature and interface dependencies, and re-runs introspection when
//! the remote object changes status.
//!
//! ## Quick start
//! ```no_run
//! use std::collections::HashSet;
//! use telebus::Connection;
//!
//! async fn show_status(bus: zbus::Connection) -> Result<(), telebus::Error> {
//!     let conn = Connection::new(
//!         bus,
//!         "org.freedesktop.Telepathy.Connection.gabble.jabber.alice",
//!         "/org/freedesktop/Telepathy/Connection/gabble/jabber/alice",
//!     )?;
//!     conn.become_ready(HashSet::from([Connection::FEATURE_CORE])).await?;
//!     println!("{:?}", conn.connection_status());
//!     Ok(())
//! }
//! ```
//!
//! ## Readiness rules
//! - A *critical* feature must introspect successfully for a request naming
//!   it to succeed; a non-critical feature resolves the request either way,
//!   and [`Connection::missing_features`] (and friends) say what is absent.
//! - Requests for a feature set equal to one still in flight share that
//!   operation instead of starting another.
//! - A proxy invalidation (connection disconnected, channel closed, account
//!   removed) fails all outstanding requests with the invalidation error.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::dbg_macro)]

#[cfg(all(feature = "rt-async-io", feature = "rt-tokio"))]
compile_error!("features `rt-async-io` and `rt-tokio` are mutually exclusive; enable exactly one.");

#[cfg(not(any(feature = "rt-async-io", feature = "rt-tokio")))]
compile_error!(
    "missing runtime feature: enable one of `rt-async-io` or `rt-tokio` (default enables `rt-async-io`)."
);

mod account;
mod bus;
mod channel;
mod client;
mod connection;
mod contacts;
mod dispatch;
mod error;
mod fake_handler;
mod feature;
mod pending;
mod proxy;
mod readiness;
mod tasks;
mod util;

pub use crate::account::Account;
pub use crate::channel::Channel;
pub use crate::client::{Approver, ChannelFilter, ClientRegistrar, Handler, Observer};
pub use crate::connection::{Connection, ConnectionStatus, PresenceStatuses};
pub use crate::contacts::ContactManager;
pub use crate::dispatch::ChannelDispatchOperation;
pub use crate::error::{
    Error, Result, TP_ERROR_CANCELLED, TP_ERROR_DISCONNECTED, TP_ERROR_INVALID_ARGUMENT,
    TP_ERROR_NOT_AVAILABLE, TP_ERROR_OBJECT_REMOVED,
};
pub use crate::feature::{Feature, Features, IntrospectFn, Introspectable, Introspectables};
pub use crate::pending::PendingReady;
pub use crate::proxy::{ProxyCore, Validity};
pub use crate::readiness::ReadinessHelper;
