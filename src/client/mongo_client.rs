//! MongoDB member client using the official `mongodb` driver.
//!
//! The operator only ever needs two read-only admin commands against a
//! member, `ping` and `buildInfo`, so the driver sits behind the small
//! [`MemberConnector`]/[`MemberSession`] seam. Tests swap in an in-memory
//! connector.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Database};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::controller::error::Error;

/// Default dial timeout for member probes.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur while talking to a member.
#[derive(Error, Debug)]
pub enum MongoError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("Unexpected reply to {command}: {message}")]
    Reply { command: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<MongoError> for Error {
    fn from(e: MongoError) -> Self {
        Error::Connectivity(e.to_string())
    }
}

/// Administrative credentials read from the users secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach one or more members.
#[derive(Clone, Debug)]
pub struct DialInfo {
    /// `host:port` addresses.
    pub addresses: Vec<String>,
    /// Replica set name for replset-aware connections.
    pub replset: Option<String>,
    pub credentials: Option<Credentials>,
    /// Dial and server selection timeout.
    pub timeout: Duration,
    /// Talk to exactly one address and skip topology discovery.
    pub direct: bool,
}

impl DialInfo {
    /// Replica-set-aware dial across every known member.
    pub fn replset(addresses: Vec<String>, replset: &str) -> Self {
        Self {
            addresses,
            replset: Some(replset.to_string()),
            credentials: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
            direct: false,
        }
    }

    /// Direct dial of a single member.
    pub fn direct(address: &str) -> Self {
        Self {
            addresses: vec![address.to_string()],
            replset: None,
            credentials: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
            direct: true,
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the dial timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Driver options for this dial: fail fast, no retries.
    pub fn client_options(&self) -> Result<ClientOptions, MongoError> {
        if self.addresses.is_empty() {
            return Err(MongoError::InvalidConfig("No addresses provided".to_string()));
        }
        if self.direct && self.addresses.len() != 1 {
            return Err(MongoError::InvalidConfig(format!(
                "direct connection needs exactly one address, got {}",
                self.addresses.len()
            )));
        }

        let hosts = self
            .addresses
            .iter()
            .map(|a| ServerAddress::parse(a))
            .collect::<Result<Vec<_>, _>>()?;

        let mut options = ClientOptions::default();
        options.hosts = hosts;
        options.app_name = Some("mongodb-operator".to_string());
        options.connect_timeout = Some(self.timeout);
        options.server_selection_timeout = Some(self.timeout);
        options.retry_reads = Some(false);
        options.retry_writes = Some(false);
        options.direct_connection = Some(self.direct);
        if !self.direct {
            options.repl_set_name = self.replset.clone();
        }
        if let Some(creds) = &self.credentials {
            let mut credential = Credential::default();
            credential.username = Some(creds.username.clone());
            credential.password = Some(creds.password.clone());
            credential.source = Some("admin".to_string());
            options.credential = Some(credential);
        }
        Ok(options)
    }
}

/// What `buildInfo` reports about a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
}

/// An open connection to one or more members.
#[async_trait]
pub trait MemberSession: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<(), MongoError>;

    /// Server build information.
    async fn build_info(&self) -> Result<BuildInfo, MongoError>;
}

/// Opens member sessions.
#[async_trait]
pub trait MemberConnector: Send + Sync {
    async fn connect(&self, info: &DialInfo) -> Result<Box<dyn MemberSession>, MongoError>;
}

/// Connector backed by the `mongodb` driver.
#[derive(Clone, Debug, Default)]
pub struct MongoConnector;

#[async_trait]
impl MemberConnector for MongoConnector {
    #[instrument(skip(self, info), fields(addresses = ?info.addresses, direct = info.direct))]
    async fn connect(&self, info: &DialInfo) -> Result<Box<dyn MemberSession>, MongoError> {
        let options = info.client_options()?;
        let client = Client::with_options(options)?;
        debug!("Created MongoDB client");
        Ok(Box::new(MongoSession { client }))
    }
}

/// Session backed by a driver client.
pub struct MongoSession {
    client: Client,
}

impl MongoSession {
    fn admin(&self) -> Database {
        self.client.database("admin")
    }

    async fn run(&self, command: Document) -> Result<Document, MongoError> {
        Ok(self.admin().run_command(command).await?)
    }
}

#[async_trait]
impl MemberSession for MongoSession {
    async fn ping(&self) -> Result<(), MongoError> {
        self.run(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn build_info(&self) -> Result<BuildInfo, MongoError> {
        let reply = self.run(doc! { "buildInfo": 1 }).await?;
        parse_build_info(&reply)
    }
}

/// Extract the version from a `buildInfo` reply.
pub fn parse_build_info(reply: &Document) -> Result<BuildInfo, MongoError> {
    let version = reply.get_str("version").map_err(|e| MongoError::Reply {
        command: "buildInfo".to_string(),
        message: e.to_string(),
    })?;
    Ok(BuildInfo {
        version: version.to_string(),
    })
}
