// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Controller/node wire protocol.
//!
//! # Protocol
//!
//! Messages are newline-delimited JSON (NDJSON). Each message is a complete
//! JSON object followed by a single `\n`; standard JSON string escaping keeps
//! line feeds out of payloads. No length limit is imposed here; wrap the
//! reader if you need one.
//!
//! ## Node → Controller
//!
//! - `register` - announce the node (name, optional id, token, labels, version)
//! - `heartbeat` - liveness
//! - `agent_register` / `agent_unregister` - agent presence
//! - `task_result` - task progress or outcome
//!
//! ## Controller → Node
//!
//! - `register_ack` - assigned node id
//! - `task` - run a prompt on an agent
//! - `error` - request rejected
//!
//! ## Client → Controller
//!
//! - `task` as the first message - submit a task (`agent`, `prompt`); the
//!   controller answers with one `task_result` (status `pending`) or `error`
//!   and closes the connection
//!
//! End of stream surfaces as [`WireError::StreamClosed`], which callers treat
//! as an ordinary disconnect.

pub mod codec;
pub mod error;
pub mod protocol;

pub use codec::{framed, Decoder, Encoder};
pub use error::{WireError, WireResult};
pub use protocol::{MessageType, WireMessage};
