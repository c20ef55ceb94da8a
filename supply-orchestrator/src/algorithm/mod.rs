//! Filter + score placement of docker VMs onto physical hosts.
//!
//! A [`Registry`] holds the ordered predicates and weighted priorities; the generator gets one
//! at construction time. Scheduling is: every predicate must pass, priorities are computed in
//! parallel and summed, then hosts are sorted and interleaved across the anti-affinity
//! dimension.

use supply_common::{campus, AntiAffinityLevel};
use supply_providers::inventory::{DvmHost, HostInfo};

pub mod predicates;
pub mod priorities;
pub mod sort;

pub use predicates::{CpuProviderRules, Predicate};
pub use priorities::Priority;

/// Maximum number of docker VMs on one physical host.
pub const MAX_VIRTUAL_RATIO: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum AlgorithmError {
    #[error("no eligible host among {total}: {}", fmt_rejections(.rejected))]
    NoEligibleHost {
        total: usize,
        /// `(predicate, hosts it rejected)` in registry order.
        rejected: Vec<(String, usize)>,
    },
    #[error("priority {name} failed: {reason}")]
    PriorityFailed { name: String, reason: String },
    #[error("invalid device class pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

fn fmt_rejections(rejected: &[(String, usize)]) -> String {
    rejected
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(name, n)| format!("{}={}", name, n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Candidate docker host, with CMDB topology folded in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Host {
    pub ip: String,
    pub asset_id: String,
    pub cluster_id: String,
    pub region: String,
    pub zone: String,
    pub module: String,
    pub rack: String,
    pub device_class: String,
    pub kernel_version: String,
    pub total_cores: u32,
    pub used_cores: u32,
    pub total_mem_gb: u32,
    pub used_mem_gb: u32,
    pub scheduled_vms: u32,
}

impl Host {
    pub fn from_inventory(host: &DvmHost, topo: Option<&HostInfo>) -> Self {
        let mut h = Host {
            ip: host.ip.clone(),
            asset_id: host.asset_id.clone(),
            cluster_id: host.cluster_id.clone(),
            region: host.region.clone(),
            zone: host.zone.clone(),
            device_class: host.device_class.clone(),
            kernel_version: host.kernel_version.clone(),
            total_cores: host.total_cores,
            used_cores: host.used_cores,
            total_mem_gb: host.total_mem_gb,
            used_mem_gb: host.used_mem_gb,
            scheduled_vms: host.scheduled_vms,
            ..Default::default()
        };
        if let Some(t) = topo {
            h.module = t.module.clone();
            h.rack = t.rack.clone();
            h.zone = campus(&host.zone, &t.sub_zone).to_string();
        }
        h
    }

    /// How many VMs of the requested shape still fit by cpu and memory.
    pub fn allocatable(&self, cores: u32, mem_gb: u32) -> u32 {
        let free_cores = self.total_cores.saturating_sub(self.used_cores);
        let free_mem = self.total_mem_gb.saturating_sub(self.used_mem_gb);
        let by_cpu = if cores == 0 { u32::MAX } else { free_cores / cores };
        let by_mem = if mem_gb == 0 { u32::MAX } else { free_mem / mem_gb };
        by_cpu.min(by_mem)
    }

    pub fn dimension(&self, level: AntiAffinityLevel) -> &str {
        match level {
            AntiAffinityLevel::None => "",
            AntiAffinityLevel::Rack => &self.rack,
            AntiAffinityLevel::Module => &self.module,
            AntiAffinityLevel::Campus => &self.zone,
        }
    }
}

/// What one VM needs.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    pub region: String,
    /// Empty accepts any campus.
    pub zone: String,
    pub kernel_version: String,
    pub cores: u32,
    pub mem_gb: u32,
    pub cpu_provider: String,
    pub anti_affinity: AntiAffinityLevel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoredHost {
    pub host: Host,
    pub score: f64,
}

pub struct Registry {
    predicates: Vec<Predicate>,
    priorities: Vec<Priority>,
}

impl Registry {
    pub fn new(predicates: Vec<Predicate>, priorities: Vec<Priority>) -> Self {
        Self {
            predicates,
            priorities,
        }
    }

    /// Docker VM placement as shipped.
    pub fn default_dvm() -> Result<Self, AlgorithmError> {
        let rules = CpuProviderRules::builtin()?;
        Ok(Self::new(
            vec![
                predicates::virtual_ratio(),
                predicates::region(),
                predicates::zone(),
                predicates::kernel_version(),
                predicates::cpu_provider(rules),
            ],
            vec![priorities::balanced_resource_allocation(1.0)],
        ))
    }

    pub fn predicate_names(&self) -> Vec<&'static str> {
        self.predicates.iter().map(|p| p.name).collect()
    }

    /// Hosts passing every predicate, or the rejection tally when none does.
    pub fn filter(&self, selector: &Selector, hosts: Vec<Host>) -> Result<Vec<Host>, AlgorithmError> {
        let total = hosts.len();
        let mut rejected: Vec<(String, usize)> =
            self.predicates.iter().map(|p| (p.name.to_string(), 0)).collect();
        let mut eligible = Vec::new();
        for host in hosts {
            let mut ok = true;
            for (i, p) in self.predicates.iter().enumerate() {
                if !(p.check)(&host, selector) {
                    rejected[i].1 += 1;
                    ok = false;
                }
            }
            if ok {
                eligible.push(host);
            }
        }
        if eligible.is_empty() {
            return Err(AlgorithmError::NoEligibleHost { total, rejected });
        }
        Ok(eligible)
    }

    pub fn score(&self, selector: &Selector, hosts: &[Host]) -> Result<Vec<f64>, AlgorithmError> {
        priorities::run_all(&self.priorities, selector, hosts)
    }

    /// Filter, score, sort and interleave.
    pub fn schedule(
        &self,
        selector: &Selector,
        hosts: Vec<Host>,
    ) -> Result<Vec<ScoredHost>, AlgorithmError> {
        let eligible = self.filter(selector, hosts)?;
        let scores = self.score(selector, &eligible)?;
        let scored = eligible
            .into_iter()
            .zip(scores)
            .map(|(host, score)| ScoredHost { host, score })
            .collect();
        Ok(sort::sort_and_interleave(scored, selector.anti_affinity))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn host(ip: &str, rack: &str, used_cores: u32, vms: u32) -> Host {
        Host {
            ip: ip.to_string(),
            asset_id: format!("A-{}", ip),
            cluster_id: "c1".into(),
            region: "ap-guangzhou".into(),
            zone: "gz-1".into(),
            module: "m1".into(),
            rack: rack.to_string(),
            device_class: "Y0-MI52-25G".into(),
            kernel_version: "3.10.107-1-tlinux2-0046".into(),
            total_cores: 48,
            used_cores,
            total_mem_gb: 96,
            used_mem_gb: used_cores * 2,
            scheduled_vms: vms,
        }
    }

    pub fn selector() -> Selector {
        Selector {
            region: "ap-guangzhou".into(),
            zone: String::new(),
            kernel_version: String::new(),
            cores: 8,
            mem_gb: 16,
            cpu_provider: String::new(),
            anti_affinity: AntiAffinityLevel::Rack,
        }
    }

    #[test]
    fn allocatable_takes_the_tighter_resource() {
        let mut h = host("10.0.0.1", "r1", 0, 0);
        assert_eq!(h.allocatable(8, 16), 6);
        h.used_mem_gb = 90;
        assert_eq!(h.allocatable(8, 16), 0);
    }

    #[test]
    fn empty_result_reports_rejections() {
        let reg = Registry::default_dvm().unwrap();
        let full = host("10.0.0.1", "r1", 0, 3);
        let mut elsewhere = host("10.0.0.2", "r1", 0, 0);
        elsewhere.region = "ap-shanghai".into();
        let err = reg
            .schedule(&selector(), vec![full, elsewhere])
            .unwrap_err();
        match err {
            AlgorithmError::NoEligibleHost { total, rejected } => {
                assert_eq!(total, 2);
                assert_eq!(rejected[0], ("virtual_ratio".to_string(), 1));
                assert_eq!(rejected[1], ("region".to_string(), 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn schedule_spreads_across_racks() {
        let reg = Registry::default_dvm().unwrap();
        let hosts = vec![
            host("10.0.0.1", "r1", 0, 0),
            host("10.0.0.2", "r1", 0, 0),
            host("10.0.0.3", "r2", 0, 0),
            host("10.0.0.4", "r2", 0, 0),
        ];
        let order: Vec<String> = reg
            .schedule(&selector(), hosts)
            .unwrap()
            .into_iter()
            .map(|s| s.host.rack)
            .collect();
        assert_eq!(order, vec!["r1", "r2", "r1", "r2"]);
    }
}
