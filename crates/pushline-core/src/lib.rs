//! Core domain models and storage for the pushline notification pipeline.
//!
//! Provides strongly-typed identifiers, the notification and delivery-job
//! entities, the error taxonomy, and the Postgres repository layer. The
//! delivery crate builds on these foundations; nothing here talks to the
//! push gateway.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeliveryJob, DeviceToken, JobId, JobStatus, Notification, NotificationId, Platform, UserId,
};
pub use time::{Clock, RealClock, TestClock};
