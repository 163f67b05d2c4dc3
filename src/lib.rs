//! # Project Ingest
//!
//! Ingests uploaded project archives (ZIP) into a storage backend, detects
//! unchanged re-uploads by content hash, and carries per-file annotations
//! across project replacements.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌─────────────────┐
//! │  Upload  │──▶│  Extract   │──▶│   Hash   │──▶│ Commit          │
//! │ (.zip)   │   │ skip+guard │   │ SHA-256  │   │ local / S3      │
//! └──────────┘   └────────────┘   └────┬─────┘   └────────┬────────┘
//!                                      │                  │
//!                                      ▼                  ▼
//!                               ┌────────────┐     ┌────────────┐
//!                               │  Registry  │     │ Annotations│
//!                               │  (SQLite)  │     │  (SQLite)  │
//!                               └────────────┘     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest init                    # create database
//! ingest upload ./demo.zip       # extract, hash, commit
//! ingest projects                # list registered projects
//! ingest tree demo               # browse the committed tree
//! ingest describe demo src/Main.java --set "entry point"
//! ingest verify demo             # re-hash storage against the registry
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Library error type |
//! | [`skip`] | Which archive entries are dropped |
//! | [`archive`] | Secure ZIP extraction and root flattening |
//! | [`hasher`] | Content fingerprinting |
//! | [`merge`] | Annotation carry-over across replaces |
//! | [`storage`] | Local and S3 storage backends |
//! | [`registry`] | Project registry |
//! | [`annotations`] | Per-file annotation store |
//! | [`tree`] | File tree view of a project |
//! | [`ingest`] | Upload state machine |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod annotations;
pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod hasher;
pub mod ingest;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod registry;
pub mod skip;
pub mod storage;
pub mod tree;
