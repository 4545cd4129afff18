// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging setup.
//!
//! Every component logs through `tracing`; this module installs the
//! subscriber once at startup:
//!
//! ```rust,ignore
//! use agentfleet::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::from_flags(cli.debug, cli.trace))?;
//! ```
//!
//! Levels follow one convention across the crate: `info` for lifecycle
//! (listener bound, node registered, leadership gained), `debug` for
//! per-message detail, `warn` for recoverable anomalies and `error` for
//! failures that stop a component.

mod init;

pub use init::{init_telemetry, TelemetryConfig};
