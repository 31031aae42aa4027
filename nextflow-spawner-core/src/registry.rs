//! Static registration tables
//!
//! Hubs look spawners and proxy entry points up by name, the way plugin entry points are
//! declared for a package. The tables are fixed at compile time.

use crate::config::SpawnerConfig;
use crate::proxy::{ignite, ProxyCommand};
use crate::spawner::NextflowSpawner;
use crate::Result;

pub type SpawnerFactory = fn(SpawnerConfig) -> Result<NextflowSpawner>;
pub type ProxyEntryPoint = fn() -> Result<ProxyCommand>;

static SPAWNERS: &[(&str, SpawnerFactory)] =
    &[("nextflow", NextflowSpawner::from_config as SpawnerFactory)];

static PROXY_ENTRY_POINTS: &[(&str, ProxyEntryPoint)] =
    &[("nextflow", ignite as ProxyEntryPoint)];

pub fn spawner_factory(name: &str) -> Option<SpawnerFactory> {
    SPAWNERS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| *factory)
}

pub fn proxy_entry_point(name: &str) -> Option<ProxyEntryPoint> {
    PROXY_ENTRY_POINTS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, entry)| *entry)
}

pub fn spawner_names() -> Vec<&'static str> {
    SPAWNERS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert!(spawner_factory("nextflow").is_some());
        assert!(spawner_factory("jupyter").is_none());
        assert!(proxy_entry_point("nextflow").is_some());
        assert!(proxy_entry_point("rstudio").is_none());
        assert_eq!(spawner_names(), vec!["nextflow"]);
    }

    #[test]
    fn test_factory_validates_config() {
        let factory = spawner_factory("nextflow").unwrap();
        assert!(factory(SpawnerConfig::default()).is_err());
    }
}
