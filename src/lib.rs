// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # agora
//!
//! An event-driven workflow coordinator for autonomous agents.
//!
//! Events flow into an append-only log. Triggers turn matching events into
//! proposals; approved proposals expand into steps; agent executors claim
//! steps by kind and run them. A periodic heartbeat drives trigger
//! evaluation, expansion and recovery of abandoned claims.
//!
//! ## Architecture
//!
//! - **Event log** (`event`): sequenced, append-only records of what happened
//! - **Conditions** (`condition`): a closed predicate language over events
//! - **Triggers** (`trigger`): condition→proposal rules with cooldowns
//! - **State machine** (`workflow`): proposal and step transitions
//! - **Store** (`store`): in-memory (DashMap) or durable (redb) persistence
//!   with atomic conditional updates
//! - **Lifecycle** (`lifecycle`): store-backed transitions plus event emission
//! - **Heartbeat** (`heartbeat`) and **executors** (`executor`): the actors
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agora::clock::SystemClock;
//! use agora::executor::ExecutorBuilder;
//! use agora::heartbeat::{Heartbeat, HeartbeatConfig};
//! use agora::lifecycle::Workflow;
//! use agora::store::MemStore;
//!
//! let workflow = Workflow::new(Arc::new(MemStore::new()), Arc::new(SystemClock), 3);
//! workflow
//!     .submit_proposal("ship", vec!["build".into()], true)
//!     .unwrap();
//!
//! Heartbeat::new(workflow.clone(), HeartbeatConfig::default()).tick();
//!
//! let builder = ExecutorBuilder::new("builder")
//!     .handler("build", |_step| Ok(serde_json::json!({"artifact": "app.tar"})))
//!     .build(workflow)
//!     .unwrap();
//! builder.poll_once().unwrap();
//! ```

pub mod clock;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod heartbeat;
pub mod lifecycle;
pub mod paths;
pub mod store;
pub mod trigger;
pub mod workflow;
