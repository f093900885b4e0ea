//! Test doubles for the transport layer, shared by the unit tests of the controllers and the
//!  end-to-end scenario tests.

pub mod simulated_network;
pub mod tracking_transport;
