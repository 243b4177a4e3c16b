//! # CMS Mirror
//!
//! One-way reconciliation of a hosted collection store against a headless
//! content store.
//!
//! Records authored in the source store (categories, materials, locations,
//! creators, works) are mirrored into the destination's collections in two
//! locales. Runs are incremental and idempotent: identity mappings pair
//! source ids with destination ids, a content hash ledger skips records
//! whose projection did not change, and destination items no current
//! record claims are deleted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ Source store│──▶│ Pipeline                 │──▶│ Destination  │
//! │ (queries)   │   │  phases → Reconciler     │   │ (REST, rate  │
//! └─────────────┘   │  Projector · Ledger · Map│   │  limited)    │
//!                   └────────────┬─────────────┘   └──────────────┘
//!                                │
//!                      ┌─────────┴─────────┐
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │   HTTP   │
//!                 │ (mirror) │       │ (/sync)  │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error taxonomy |
//! | [`models`] | Core data types |
//! | [`collections`] | The collection specs and their phases |
//! | [`remote`] | Rate-limited REST client with backoff |
//! | [`destination`] | Collection store adapter |
//! | [`source`] | Content store adapter |
//! | [`mapping`] | Identity mapping store |
//! | [`ledger`] | Content hash ledger |
//! | [`projector`] | Locale projection and rich text rendering |
//! | [`state`] | Persisted reconciliation state |
//! | [`reconciler`] | Per-collection reconciliation |
//! | [`pipeline`] | Phase scheduling and run reports |
//! | [`progress`] | Progress reporting |
//! | [`server`] | HTTP sync surface |
//! | [`db`] | State database connection |
//! | [`migrate`] | State schema |

pub mod collections;
pub mod collections_cmd;
pub mod config;
pub mod db;
pub mod destination;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod projector;
pub mod reconciler;
pub mod remote;
pub mod server;
pub mod source;
pub mod state;
pub mod state_cmd;
pub mod sync_cmd;
