//! The data-migration reconciliation core.
//!
//! Two per-node components drive every partition replica of every active
//! migration to the state the cluster currently seeks:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         MigrationTable                           │
//! │        (durable authority: migrations + sought states)           │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ notifications                          ▲ advance writes
//!        ▼                                        │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Backend                               │
//! │  ┌────────────────────────┐   ┌─────────────────────────────┐   │
//! │  │    Local reconciler    │   │    Coordinator (leader of   │   │
//! │  │  work_states per ntp   │   │  the controller partition)  │   │
//! │  │  start/stop worker jobs│   │  status fan-out, advances   │   │
//! │  └────────────────────────┘   └─────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ perform / abort                        │ check_ntp_states
//!        ▼                                        ▼
//! ┌────────────────────────┐          ┌─────────────────────────────┐
//! │         Worker         │          │     Peer node backends      │
//! │ one job per led ntp,   │          │   (answer from their own    │
//! │ retry on transient err │          │      replica work states)   │
//! └────────────────────────┘          └─────────────────────────────┘
//! ```
//!
//! The backend runs a single loop fiber: wait for a wakeup or the poll
//! timer, take the backend mutex, perform one work cycle, repeat. Every
//! reconciliation map is mutated only inside that cycle, which is what
//! keeps the coordinator invariants intact between cycles.

pub mod backend;
pub mod rpc;
pub mod work;
pub mod worker;

pub use backend::{Backend, ReplicaStatus};
pub use rpc::{
    CheckNtpStatesReply, CheckNtpStatesRequest, InMemoryStatusRouter, NtpStateEntry,
    NtpStateReplyEntry, StatusRpcClient, StatusRpcHandler,
};
pub use work::{
    InboundPartitionWorkInfo, NoOpPartitionWorkRunner, OutboundPartitionWorkInfo, PartitionWork,
    PartitionWorkInfo, PartitionWorkRunner,
};
pub use worker::{WorkCompletion, Worker};
