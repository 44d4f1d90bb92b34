//! The proxy daemon's internals: configuration, token auth, the backend
//! driver interface, shared sessions and the HTTP/WebSocket surface. The
//! `scryd` binary is a thin wrapper around [`proxy::Proxy`] and
//! [`routers::routers`].

pub mod auth;
pub mod config;
pub mod driver;
pub mod errdefs;
pub mod proxy;
pub mod routers;
pub mod session;
