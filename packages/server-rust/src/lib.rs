//! Forrst server: the RPC dispatch engine and its HTTP binding.
//!
//! [`service`] holds the transport-agnostic engine; [`network`] exposes it as
//! `POST /forrst` over axum.

pub mod network;
pub mod service;
