//! Cacheable read operations and their results.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vmfleet_hypervisor::{
    DomainRecord, DomainStats, DomainSummary, HostCapabilities, Hypervisor, HypervisorError,
    PoolInfo, VolumeInfo,
};

/// Operation class. Each class has its own TTL and cache bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ListDomains,
    DomainInfo,
    DomainXml,
    DomainStats,
    HostCapabilities,
    StoragePools,
    PoolVolumes,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::ListDomains,
        Operation::DomainInfo,
        Operation::DomainXml,
        Operation::DomainStats,
        Operation::HostCapabilities,
        Operation::StoragePools,
        Operation::PoolVolumes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListDomains => "list_domains",
            Operation::DomainInfo => "domain_info",
            Operation::DomainXml => "domain_xml",
            Operation::DomainStats => "domain_stats",
            Operation::HostCapabilities => "host_capabilities",
            Operation::StoragePools => "storage_pools",
            Operation::PoolVolumes => "pool_volumes",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read request against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "operation", content = "arg", rename_all = "snake_case")]
pub enum Query {
    ListDomains,
    DomainInfo(String),
    DomainXml(String),
    DomainStats(String),
    HostCapabilities,
    StoragePools,
    /// Volumes of the named pool
    PoolVolumes(String),
}

impl Query {
    pub fn operation(&self) -> Operation {
        match self {
            Query::ListDomains => Operation::ListDomains,
            Query::DomainInfo(_) => Operation::DomainInfo,
            Query::DomainXml(_) => Operation::DomainXml,
            Query::DomainStats(_) => Operation::DomainStats,
            Query::HostCapabilities => Operation::HostCapabilities,
            Query::StoragePools => Operation::StoragePools,
            Query::PoolVolumes(_) => Operation::PoolVolumes,
        }
    }

    /// Argument fingerprint, unique within the operation's bucket.
    pub fn fingerprint(&self) -> &str {
        match self {
            Query::DomainInfo(arg)
            | Query::DomainXml(arg)
            | Query::DomainStats(arg)
            | Query::PoolVolumes(arg) => arg,
            Query::ListDomains | Query::HostCapabilities | Query::StoragePools => "",
        }
    }

    /// Domain the query is about, if any.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Query::DomainInfo(uuid) | Query::DomainXml(uuid) | Query::DomainStats(uuid) => {
                Some(uuid)
            }
            Query::ListDomains
            | Query::HostCapabilities
            | Query::StoragePools
            | Query::PoolVolumes(_) => None,
        }
    }

    /// Perform the remote call.
    pub async fn execute(&self, handle: &dyn Hypervisor) -> Result<Value, HypervisorError> {
        Ok(match self {
            Query::ListDomains => Value::Domains(handle.list_domains().await?),
            Query::DomainInfo(uuid) => Value::Domain(handle.domain_info(uuid).await?),
            Query::DomainXml(uuid) => Value::Xml(handle.domain_xml(uuid).await?),
            Query::DomainStats(uuid) => Value::Stats(handle.domain_stats(uuid).await?),
            Query::HostCapabilities => Value::Capabilities(handle.host_capabilities().await?),
            Query::StoragePools => Value::Pools(handle.list_pools().await?),
            Query::PoolVolumes(pool) => Value::Volumes(handle.list_volumes(pool).await?),
        })
    }
}

/// Result of a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Domains(Vec<DomainSummary>),
    Domain(DomainRecord),
    Xml(String),
    Stats(DomainStats),
    Capabilities(HostCapabilities),
    Pools(Vec<PoolInfo>),
    Volumes(Vec<VolumeInfo>),
}

impl Value {
    /// Domain UUIDs this value describes.
    pub fn domain_tags(&self) -> BTreeSet<String> {
        match self {
            Value::Domains(list) => list.iter().map(|d| d.uuid.clone()).collect(),
            Value::Domain(record) => BTreeSet::from([record.uuid.clone()]),
            Value::Stats(stats) => BTreeSet::from([stats.uuid.clone()]),
            Value::Xml(_) | Value::Capabilities(_) | Value::Pools(_) | Value::Volumes(_) => {
                BTreeSet::new()
            }
        }
    }

    pub fn into_domains(self) -> Option<Vec<DomainSummary>> {
        match self {
            Value::Domains(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_domain(self) -> Option<DomainRecord> {
        match self {
            Value::Domain(record) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_hypervisor::DomainState;

    #[test]
    fn test_query_keys() {
        let q = Query::DomainInfo("vm1".to_string());
        assert_eq!(q.operation(), Operation::DomainInfo);
        assert_eq!(q.fingerprint(), "vm1");
        assert_eq!(q.domain(), Some("vm1"));

        let q = Query::PoolVolumes("default".to_string());
        assert_eq!(q.fingerprint(), "default");
        assert_eq!(q.domain(), None);
        assert_eq!(Query::ListDomains.fingerprint(), "");
    }

    #[test]
    fn test_listing_is_tagged_with_every_domain() {
        let value = Value::Domains(vec![
            DomainSummary { uuid: "a".into(), name: "a".into(), state: DomainState::Running },
            DomainSummary { uuid: "b".into(), name: "b".into(), state: DomainState::Stopped },
        ]);
        let tags = value.domain_tags();
        assert!(tags.contains("a") && tags.contains("b"));
        assert!(Value::Xml("<domain/>".into()).domain_tags().is_empty());
    }

    #[test]
    fn test_operation_names_match_serde() {
        for op in Operation::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.as_str()));
        }
    }
}
