//! Test modules for tellus-http-ows-server crate
//!
//! This module contains integration suites driving the full dispatch
//! pipeline over in-memory requests.

pub mod soap_transport_tests;
