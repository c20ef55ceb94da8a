use regex::Regex;
use std::collections::HashMap;

use super::{AlgorithmError, Host, Selector, MAX_VIRTUAL_RATIO};

type Check = Box<dyn Fn(&Host, &Selector) -> bool + Send + Sync>;

/// Named host filter.
pub struct Predicate {
    pub name: &'static str,
    pub check: Check,
}

impl Predicate {
    pub fn new(
        name: &'static str,
        check: impl Fn(&Host, &Selector) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            check: Box::new(check),
        }
    }
}

pub fn virtual_ratio() -> Predicate {
    Predicate::new("virtual_ratio", |h, _| h.scheduled_vms < MAX_VIRTUAL_RATIO)
}

pub fn region() -> Predicate {
    Predicate::new("region", |h, s| h.region.starts_with(&s.region))
}

pub fn zone() -> Predicate {
    Predicate::new("zone", |h, s| s.zone.is_empty() || h.zone == s.zone)
}

pub fn kernel_version() -> Predicate {
    Predicate::new("kernel_version", |h, s| {
        s.kernel_version.is_empty() || kernel_compatible(&h.kernel_version, &s.kernel_version)
    })
}

pub fn cpu_provider(rules: CpuProviderRules) -> Predicate {
    Predicate::new("cpu_provider", move |h, s| {
        s.cpu_provider.is_empty() || rules.accepts(&s.cpu_provider, &h.device_class)
    })
}

/// Every dot segment but the last must be equal; the leading number of the last one must be
/// at least the requested one. `3.10.107-1-tlinux2` satisfies `3.10.100`.
pub fn kernel_compatible(host: &str, wanted: &str) -> bool {
    let h: Vec<&str> = host.split('.').collect();
    let w: Vec<&str> = wanted.split('.').collect();
    if h.len() != w.len() {
        return false;
    }
    let last = w.len() - 1;
    if h[..last] != w[..last] {
        return false;
    }
    match (leading_number(h[last]), leading_number(w[last])) {
        (Some(hv), Some(wv)) => hv >= wv,
        _ => h[last] == w[last],
    }
}

fn leading_number(s: &str) -> Option<u64> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Device class allow/deny patterns per cpu vendor.
#[derive(Clone, Debug, Default)]
pub struct CpuProviderRules {
    rules: HashMap<String, (Vec<Regex>, Vec<Regex>)>,
}

impl CpuProviderRules {
    pub fn builtin() -> Result<Self, AlgorithmError> {
        let mut r = Self::default();
        r.add("intel", &[r"^Y0-", r"^M10", r"^IT\d"], &[r"(?i)amd"])?;
        r.add("amd", &[r"(?i)^SA\d", r"(?i)amd", r"^BX"], &[])?;
        Ok(r)
    }

    pub fn add(&mut self, provider: &str, allow: &[&str], deny: &[&str]) -> Result<(), AlgorithmError> {
        let compile = |pats: &[&str]| {
            pats.iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()
        };
        self.rules
            .insert(provider.to_ascii_lowercase(), (compile(allow)?, compile(deny)?));
        Ok(())
    }

    /// Unknown providers accept nothing.
    pub fn accepts(&self, provider: &str, device_class: &str) -> bool {
        let Some((allow, deny)) = self.rules.get(&provider.to_ascii_lowercase()) else {
            return false;
        };
        let allowed = allow.is_empty() || allow.iter().any(|re| re.is_match(device_class));
        allowed && !deny.iter().any(|re| re.is_match(device_class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::tests::{host, selector};

    #[test]
    fn kernel_compare_uses_last_segment() {
        assert!(kernel_compatible("3.10.107-1-tlinux2-0046", "3.10.107"));
        assert!(kernel_compatible("3.10.107", "3.10.100-2"));
        assert!(!kernel_compatible("3.10.99", "3.10.100"));
        assert!(!kernel_compatible("4.14.105", "3.10.100"));
        assert!(!kernel_compatible("3.10", "3.10.1"));
    }

    #[test]
    fn virtual_ratio_caps_at_three() {
        let p = virtual_ratio();
        let s = selector();
        assert!((p.check)(&host("10.0.0.1", "r1", 0, 2), &s));
        assert!(!(p.check)(&host("10.0.0.1", "r1", 0, 3), &s));
    }

    #[test]
    fn region_is_a_prefix_match() {
        let p = region();
        let mut s = selector();
        s.region = "ap-guang".into();
        assert!((p.check)(&host("10.0.0.1", "r1", 0, 0), &s));
        s.region = "ap-shanghai".into();
        assert!(!(p.check)(&host("10.0.0.1", "r1", 0, 0), &s));
    }

    #[test]
    fn cpu_provider_allow_and_deny() {
        let rules = CpuProviderRules::builtin().unwrap();
        assert!(rules.accepts("intel", "Y0-MI52-25G"));
        assert!(!rules.accepts("intel", "SA2-AMD"));
        assert!(rules.accepts("AMD", "SA2-AMD"));
        assert!(!rules.accepts("arm", "Y0-MI52-25G"));

        let p = cpu_provider(rules);
        let mut s = selector();
        assert!((p.check)(&host("10.0.0.1", "r1", 0, 0), &s));
        s.cpu_provider = "amd".into();
        assert!(!(p.check)(&host("10.0.0.1", "r1", 0, 0), &s));
    }
}
