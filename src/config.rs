//! Operator configuration.
//!
//! Every setting is a command line flag with an environment variable
//! fallback, so the operator can be configured from its Deployment manifest
//! without rebuilding the image.

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Container platform the operator runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Platform {
    #[default]
    Kubernetes,
    Openshift,
}

/// Runtime configuration for the operator.
#[derive(Parser, Clone, Debug)]
#[command(name = "mongodb-operator", version, about = "Kubernetes operator for MongoDB replica sets")]
pub struct OperatorConfig {
    /// Seconds after operator start before a replica set may be initiated
    #[arg(long, env = "REPLSET_INIT_WAIT", default_value_t = 30)]
    pub replset_init_wait: u64,

    /// Dial timeout for member probes, in seconds
    #[arg(long, env = "MONGODB_TIMEOUT", default_value_t = 3)]
    pub mongodb_timeout: u64,

    /// Platform the operator is deployed on
    #[arg(long, env = "PLATFORM", value_enum, default_value_t = Platform::Kubernetes)]
    pub platform: Platform,

    /// Only watch clusters in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Seconds between watchdog member probes
    #[arg(long, env = "WATCHDOG_INTERVAL", default_value_t = 15)]
    pub watchdog_interval: u64,

    /// Port for the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            replset_init_wait: 30,
            mongodb_timeout: 3,
            platform: Platform::Kubernetes,
            watch_namespace: None,
            watchdog_interval: 15,
            health_port: 8080,
        }
    }
}

impl OperatorConfig {
    /// Quiescence window before the first bootstrap.
    pub fn init_wait(&self) -> Duration {
        Duration::from_secs(self.replset_init_wait)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.mongodb_timeout)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval)
    }
}
