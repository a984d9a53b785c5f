//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM
//! operations for database entities.

pub mod connection;
pub mod raw_datum;

pub use connection::ConnectionRepository;
pub use raw_datum::RawDatumRepository;
