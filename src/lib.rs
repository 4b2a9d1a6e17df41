//! Room and session state sync for party games played on phones around a shared screen.
//!
//! Each room runs as its own task ([`room`]); connections reach rooms through the
//! [`session::SessionManager`] and receive full-state broadcasts back.

pub mod archive;
pub mod config;
pub mod error;
pub mod quiplash;
pub mod registry;
pub mod room;
pub mod routes;
pub mod session;
pub mod sweeper;
pub mod types;
pub mod validation;
