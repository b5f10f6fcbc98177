//! UniLink Hub - Real-time notification hub for the UniLink campus platform.
//!
//! This crate pushes platform events to signed-in students over WebSockets:
//! - Authenticating clients with the platform's JWTs
//! - Tracking every live session of every user
//! - Deciding who receives each chat message, announcement and friend event
//! - Delivering without letting one slow client hold up the rest
//!
//! # Architecture
//!
//! REST handlers publish events into the [`hub`], either in-process through a
//! [`hub::HubHandle`] or over `POST /events`. A single hub task owns the
//! session [`registry`], resolves each event's audience with [`targeting`]
//! and fans the serialized frame out to per-session queues. Each
//! [`session`] drains its queue onto the socket. Nothing is persisted: a
//! user who is offline when an event is published never sees it here.

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod registry;
pub mod routes;
pub mod session;
pub mod targeting;
pub mod transport;
pub mod types;
