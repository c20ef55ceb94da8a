use std::collections::VecDeque;

use supply_common::AntiAffinityLevel;

use super::ScoredHost;

/// Sort by score descending, ties by IP ascending, then spread consecutive picks across
/// distinct anti-affinity values.
///
/// The spreading is a single look-ahead: a host sharing the dimension value of the last
/// pick is deferred, and after every pick that switches value the oldest deferred host is
/// released if it differs from that pick. With more than two values it does not guarantee
/// a perfect round-robin.
pub fn sort_and_interleave(mut hosts: Vec<ScoredHost>, level: AntiAffinityLevel) -> Vec<ScoredHost> {
    hosts.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.host.ip.cmp(&b.host.ip))
    });
    if level == AntiAffinityLevel::None {
        return hosts;
    }

    let mut out: Vec<ScoredHost> = Vec::with_capacity(hosts.len());
    let mut deferred: VecDeque<ScoredHost> = VecDeque::new();
    for h in hosts {
        let same_as_last = out
            .last()
            .map_or(false, |last| last.host.dimension(level) == h.host.dimension(level));
        if same_as_last {
            deferred.push_back(h);
            continue;
        }
        out.push(h);
        let release = match (deferred.front(), out.last()) {
            (Some(d), Some(last)) => d.host.dimension(level) != last.host.dimension(level),
            _ => false,
        };
        if release {
            if let Some(d) = deferred.pop_front() {
                out.push(d);
            }
        }
    }
    out.extend(deferred);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::tests::host;

    fn scored(ip: &str, rack: &str, score: f64) -> ScoredHost {
        ScoredHost {
            host: host(ip, rack, 0, 0),
            score,
        }
    }

    fn ips(v: &[ScoredHost]) -> Vec<&str> {
        v.iter().map(|s| s.host.ip.as_str()).collect()
    }

    #[test]
    fn ties_break_by_ip() {
        let out = sort_and_interleave(
            vec![
                scored("10.0.0.9", "r1", 1.0),
                scored("10.0.0.2", "r2", 1.0),
                scored("10.0.0.5", "r3", 2.0),
            ],
            AntiAffinityLevel::None,
        );
        assert_eq!(ips(&out), vec!["10.0.0.5", "10.0.0.2", "10.0.0.9"]);
    }

    #[test]
    fn two_racks_alternate() {
        let out = sort_and_interleave(
            vec![
                scored("10.0.0.1", "r1", 1.0),
                scored("10.0.0.2", "r1", 1.0),
                scored("10.0.0.3", "r2", 1.0),
                scored("10.0.0.4", "r2", 1.0),
            ],
            AntiAffinityLevel::Rack,
        );
        assert_eq!(
            ips(&out),
            vec!["10.0.0.1", "10.0.0.3", "10.0.0.2", "10.0.0.4"]
        );
    }

    #[test]
    fn deferred_hosts_are_released_after_each_switch() {
        let out = sort_and_interleave(
            vec![
                scored("10.0.0.1", "r1", 5.0),
                scored("10.0.0.2", "r1", 4.0),
                scored("10.0.0.3", "r1", 3.0),
                scored("10.0.0.4", "r2", 2.0),
                scored("10.0.0.5", "r3", 1.0),
            ],
            AntiAffinityLevel::Rack,
        );
        assert_eq!(
            ips(&out),
            vec!["10.0.0.1", "10.0.0.4", "10.0.0.2", "10.0.0.5", "10.0.0.3"]
        );
    }

    #[test]
    fn backlog_of_one_rack_lands_at_the_tail() {
        let out = sort_and_interleave(
            vec![
                scored("10.0.0.1", "r1", 4.0),
                scored("10.0.0.2", "r1", 3.0),
                scored("10.0.0.3", "r1", 2.0),
                scored("10.0.0.4", "r2", 1.0),
            ],
            AntiAffinityLevel::Rack,
        );
        assert_eq!(
            ips(&out),
            vec!["10.0.0.1", "10.0.0.4", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn one_rack_keeps_score_order() {
        let out = sort_and_interleave(
            vec![scored("10.0.0.2", "r1", 1.0), scored("10.0.0.1", "r1", 2.0)],
            AntiAffinityLevel::Rack,
        );
        assert_eq!(ips(&out), vec!["10.0.0.1", "10.0.0.2"]);
    }
}
