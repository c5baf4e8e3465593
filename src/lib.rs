//! # Tender Intake
//!
//! Change-tracked ingestion and idempotent extraction for tender documents.
//!
//! Documents discovered in a source are fingerprinted and classified against
//! a version ledger. New content becomes a new version, and each version is
//! claimed and driven through a staged pipeline that produces tender records
//! and searchable chunks in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────┐   ┌──────────────────────────┐
//! │  Source  │──▶│  detect  │──▶│ ledger │──▶│ state::claim → pipeline  │
//! │ list/get │   │ classify │   │ version│   │ fetch→text→fields→       │
//! └──────────┘   └──────────┘   └────────┘   │ persist→chunk+embed      │
//!                                            └────────────┬─────────────┘
//!                                                         ▼
//!                                              SQLite (tenders, chunks,
//!                                                      audit_log)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tender init                       # create database
//! tender scan                       # one pass over the source
//! tender monitor                    # poll until Ctrl-C
//! tender stats
//! tender report TND-001
//! tender query TND-001 "bid bond amount"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | Collaborator capability traits |
//! | [`detect`] | Fingerprints and change classification |
//! | [`ledger`] | Version lineage |
//! | [`state`] | Processing state machine |
//! | [`audit`] | Append-only audit log |
//! | [`pipeline`] | Stage orchestrator |
//! | [`ingest`] | Scan, dispatch, and monitor loop |
//! | [`store`] | Tender and chunk persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod audit;
pub mod chunk;
pub mod config;
pub mod db;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod search;
pub mod source;
pub mod state;
pub mod stats;
pub mod store;
pub mod structured;
pub mod traits;
