//! Validation logic for MongoDbCluster specs.
//!
//! Checks what can be rejected up front for the whole cluster. Resource
//! quantities are checked per replica set when its workload is built, so a
//! bad quantity in one replica set does not hold back the others.

use std::collections::HashSet;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::MongoDbCluster;

/// Longest cluster or replica set name. `{cluster}-{replset}-{ordinal}`
/// must stay a valid 63 character DNS label.
pub const MAX_NAME_LENGTH: usize = 28;

/// Maximum voting members in a MongoDB replica set
pub const MAX_REPLSET_SIZE: i32 = 7;

/// Validate the resource spec
pub fn validate_spec(cluster: &MongoDbCluster) -> Result<()> {
    validate_name(&cluster.name_any(), "cluster name")?;
    validate_mongod(cluster)?;
    validate_replsets(cluster)?;
    Ok(())
}

fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", what)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "{} '{}' exceeds maximum length of {} characters",
            what, name, MAX_NAME_LENGTH
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(format!(
            "{} '{}' must consist of lowercase letters, digits and '-'",
            what, name
        )));
    }
    Ok(())
}

fn validate_mongod(cluster: &MongoDbCluster) -> Result<()> {
    let mongod = &cluster.spec.mongod;
    if !(1..=65535).contains(&mongod.port) {
        return Err(Error::Validation(format!(
            "mongod.port {} is out of range",
            mongod.port
        )));
    }
    if !(mongod.wired_tiger_cache_ratio > 0.0 && mongod.wired_tiger_cache_ratio <= 1.0) {
        return Err(Error::Validation(format!(
            "mongod.wiredTigerCacheRatio {} must be in (0, 1]",
            mongod.wired_tiger_cache_ratio
        )));
    }
    if cluster.spec.version.is_empty() {
        return Err(Error::Validation("version must not be empty".to_string()));
    }
    Ok(())
}

fn validate_replsets(cluster: &MongoDbCluster) -> Result<()> {
    if cluster.spec.replsets.is_empty() {
        return Err(Error::Validation(
            "at least one replset is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for replset in &cluster.spec.replsets {
        validate_name(&replset.name, "replset name")?;
        if !seen.insert(replset.name.as_str()) {
            return Err(Error::Validation(format!(
                "replset name '{}' is used more than once",
                replset.name
            )));
        }
        if replset.size < 1 || replset.size > MAX_REPLSET_SIZE {
            return Err(Error::Validation(format!(
                "replset {} size {} must be between 1 and {}",
                replset.name, replset.size, MAX_REPLSET_SIZE
            )));
        }
    }
    Ok(())
}
