//! Normalized ledger data model shared by both stores.
//!
//! # Responsibility
//! - Define the typed record, field and timestamp shapes every component uses.
//! - Keep header text and raw cell strings from leaking past the read boundary.
//!
//! # Invariants
//! - Field identity is the closed `FieldId` enum.
//! - Timestamp parsing has exactly one entry point: `parse_timestamp`.

pub mod field;
pub mod header;
pub mod record;
pub mod timestamp;
