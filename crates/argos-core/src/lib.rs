//! Core types and trait definitions for the Argos transactional core.
//!
//! This crate is deliberately free of HTTP, consensus and database
//! dependencies. Every other crate depends on it: events and streams, the
//! aggregate state types with their deterministic reducer, and the storage
//! abstractions the event log is built on.

#![allow(async_fn_in_trait)]

pub mod academic;
pub mod calendar;
pub mod entity;
pub mod error;
pub mod event;
pub mod principal;
pub mod state;
pub mod store;
pub mod stream;

pub use error::{Error, Result};
