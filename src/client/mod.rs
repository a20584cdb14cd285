//! MongoDB client module for member probes.
//!
//! ## Architecture
//!
//! - `mongo_client`: dial options, the `MemberConnector`/`MemberSession`
//!   traits and their `mongodb` driver implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongodb_operator::client::{DialInfo, MemberConnector, MongoConnector};
//!
//! let session = MongoConnector.connect(&DialInfo::direct("rs0-0.svc:27017")).await?;
//! let version = session.build_info().await?.version;
//! ```

pub mod mongo_client;

pub use mongo_client::{
    BuildInfo, Credentials, DEFAULT_DIAL_TIMEOUT, DialInfo, MemberConnector, MemberSession,
    MongoConnector, MongoError,
};
