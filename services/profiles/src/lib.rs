//! Profiles Service
//!
//! Owns user profiles: the public username, pseudonym, description, avatar
//! and official flag of every account. Profiles are created, renamed and
//! removed in reaction to account events, and edited by their owners over
//! REST. Every change is announced on the profiles topic.
//!
//! ## Features
//!
//! - **Avatar upload sessions**: clients upload straight to S3 through a
//!   presigned URL; the service probes the object, validates it and promotes
//!   it to the account's avatar slot
//! - **Transactional outbox**: profile rows and their events commit together;
//!   a dispatcher publishes pending events to Kafka with backoff
//! - **Inbox**: account events are persisted before they are applied, so
//!   redelivery never applies an event twice
//!
//! ## Architecture
//!
//! ```text
//! accounts.v1                PostgreSQL                       profiles.v1
//! ┌──────────────┐          ┌──────────────────┐            ┌──────────────┐
//! │ account.*    │─ingress─▶│ inbox_events     │            │ profile.*    │
//! └──────────────┘          │        │         │            └──────────────┘
//!                           │     workers      │                   ▲
//!                           │        ▼         │                   │
//! ┌──────────────┐          │ profiles         │            ┌──────────────┐
//! │ REST API     │─────────▶│ outbox_events    │───────────▶│ Outbox       │
//! └──────────────┘          └──────────────────┘            │ Dispatcher   │
//!        │                                                  └──────────────┘
//!        ▼
//! ┌──────────────┐
//! │ S3 avatars   │
//! └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod contracts;
pub mod error;
pub mod inbox;
pub mod media_validator;
pub mod memory;
pub mod models;
pub mod object_store;
pub mod outbox;
pub mod pg_store;
pub mod s3_store;
pub mod service;
pub mod store;
pub mod upload_session;
pub mod upload_token;

pub use config::Config;
pub use error::{ProfileError, ProfileResult};
pub use models::Profile;
pub use service::ProfileService;
