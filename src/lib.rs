//! pipehub: control-plane hub of a distributed visualization pipeline.
//!
//! One hub runs per host. The master hub owns the topology; slaves join it
//! over TCP with a shared session key. Each hub routes control messages
//! between its manager, its UI clients and the other hubs, launches the
//! processes the pipeline needs and coordinates barriers across the cluster.

pub mod config;
pub mod error;
pub mod hub;
pub mod logger;
pub mod net;
pub mod process;
pub mod protocol;
pub mod session;
pub mod state;
pub mod supervisor;
