//! # atelier-core — operation model for the Atelier collaboration core
//!
//! The shared vocabulary between clients, the concurrency core and the
//! geometry engine: 3D primitives and the immutable [`Operation`] unit of
//! change. Everything here is plain data — no I/O, no clocks beyond the
//! creation timestamp, no geometry validation.

pub mod math;
pub mod operation;

pub use math::{EulerAngles, Point3D, Quaternion, Transform3D};
pub use operation::{Operation, OperationKind};
