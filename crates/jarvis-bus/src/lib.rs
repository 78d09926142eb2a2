// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subject-addressed pub/sub with request/reply — the inter-process backbone
//! of the jarvis fabric.
//!
//! The hub hosts the [`Broker`]; agents and channel adapters attach with
//! [`BusClient`].  Delivery is at-least-once: a reconnect can replay an
//! in-flight frame, and slow consumers shed load, so every handler must be
//! idempotent.

mod broker;
mod client;
mod error;
mod frame;

pub use broker::{subject_matches, Broker};
pub use client::{BusClient, BusMessage, Subscription, REQUEST_TIMEOUT};
pub use error::BusError;
pub use frame::{BusFrame, MAX_FRAME_BYTES};
