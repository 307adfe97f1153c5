//! `eventually-worker` is a long-running consumer that sits in front of an
//! Event Store, keeps persistent (consumer group) subscriptions open on a set
//! of streams and dispatches every delivered event to in-process handlers.
//!
//! ## Pipeline
//!
//! Every record delivered by a [`store::Connection`] goes through:
//!
//! 1. [`record::decode`], which turns the wire-level [`RawEventRecord`]
//!    into a [`CanonicalEvent`];
//! 2. the [`Resolver`], which maps the event type to a registered
//!    [`Receivable`] local event type, if any;
//! 3. the [`EventBus`], which runs the type-keyed listeners for resolved
//!    events, or the name-keyed listeners for everything else.
//!
//! The [`Dispatcher`] acknowledges the record when the whole pipeline
//! succeeds, and negatively acknowledges it otherwise: a failing handler
//! never takes the worker down.
//!
//! ## Resilience
//!
//! The [`SubscriptionManager`] opens one connection and one persistent
//! subscription per configured stream, all driven on the same task.
//! The [`Supervisor`] restarts the whole pipeline after a fixed delay
//! whenever the processing loop terminates.
//!
//! [`RawEventRecord`]: record::RawEventRecord
//! [`CanonicalEvent`]: record::CanonicalEvent
//! [`Resolver`]: resolver::Resolver
//! [`Receivable`]: resolver::Receivable
//! [`EventBus`]: bus::EventBus
//! [`Dispatcher`]: dispatch::Dispatcher
//! [`SubscriptionManager`]: subscription::SubscriptionManager
//! [`Supervisor`]: supervisor::Supervisor

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod inmemory;
pub mod record;
pub mod report;
pub mod resolver;
pub mod store;
pub mod subscription;
pub mod supervisor;

pub use bus::EventBus;
pub use config::Config;
pub use dispatch::Dispatcher;
pub use record::{CanonicalEvent, RawEventRecord};
pub use report::{Reporter, TracingReporter};
pub use resolver::{NamingStrategy, Receivable, Resolver, TypeRegistry};
pub use store::{AcknowledgeableRecord, Connection, EventStore};
pub use subscription::{StreamConfig, SubscriptionManager};
pub use supervisor::{Pipeline, Supervisor};
