//! Frontend address allocation from an IP pool range.
//!
//! There is no allocation ledger: the caller passes the addresses currently
//! held by instances bound to the same cluster and pool, and the lowest free
//! address in `[start, end]` wins. Because the exclusion set is recomputed
//! from live objects on every call, allocation must be deterministic or
//! repeated reconciles of one binding would oscillate.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::Error;

/// Returns the lowest address in `start..=end` that is not in `excluded`.
///
/// Both ends must be the same address family. Excluded entries that do not
/// parse as addresses are ignored.
pub fn allocate<S: AsRef<str>>(start: &str, end: &str, excluded: &[S]) -> Result<IpAddr, Error> {
    let first = parse(start)?;
    let last = parse(end)?;

    let taken: HashSet<IpAddr> = excluded
        .iter()
        .filter_map(|ip| ip.as_ref().parse().ok())
        .collect();

    let exhausted = || Error::RangeExhausted {
        start: start.to_string(),
        end: end.to_string(),
    };

    match (first, last) {
        (IpAddr::V4(a), IpAddr::V4(b)) => (u32::from(a)..=u32::from(b))
            .map(|n| IpAddr::from(std::net::Ipv4Addr::from(n)))
            .find(|ip| !taken.contains(ip))
            .ok_or_else(exhausted),
        (IpAddr::V6(a), IpAddr::V6(b)) => (u128::from(a)..=u128::from(b))
            .map(|n| IpAddr::from(std::net::Ipv6Addr::from(n)))
            .find(|ip| !taken.contains(ip))
            .ok_or_else(exhausted),
        _ => Err(Error::validation(format!(
            "ip range {start}-{end} mixes address families"
        ))),
    }
}

/// Whether `ip` lies numerically within `start..=end`.
///
/// Unparseable input, or mixed families, is never in range.
pub fn in_range(ip: &str, start: &str, end: &str) -> bool {
    let (Ok(ip), Ok(start), Ok(end)) = (
        ip.parse::<IpAddr>(),
        start.parse::<IpAddr>(),
        end.parse::<IpAddr>(),
    ) else {
        return false;
    };

    match (ip, start, end) {
        (IpAddr::V4(ip), IpAddr::V4(s), IpAddr::V4(e)) => {
            (u32::from(s)..=u32::from(e)).contains(&u32::from(ip))
        }
        (IpAddr::V6(ip), IpAddr::V6(s), IpAddr::V6(e)) => {
            (u128::from(s)..=u128::from(e)).contains(&u128::from(ip))
        }
        _ => false,
    }
}

fn parse(ip: &str) -> Result<IpAddr, Error> {
    ip.parse()
        .map_err(|_| Error::validation(format!("invalid ip address {ip:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn picks_lowest_free_address() {
        let ip = allocate("10.0.0.1", "10.0.0.3", &["10.0.0.1", "10.0.0.2"]).unwrap();
        assert_eq!(ip.to_string(), "10.0.0.3");
    }

    #[test]
    fn fills_holes_before_the_tail() {
        let ip = allocate("10.0.0.1", "10.0.0.9", &["10.0.0.1", "10.0.0.3"]).unwrap();
        assert_eq!(ip.to_string(), "10.0.0.2");
    }

    #[test]
    fn full_range_is_exhausted() {
        let err = allocate("10.0.0.1", "10.0.0.3", &["10.0.0.3", "10.0.0.1", "10.0.0.2"])
            .unwrap_err();
        assert!(matches!(err, Error::RangeExhausted { .. }));
    }

    #[test]
    fn end_is_inclusive_and_single_address_ranges_work() {
        assert_eq!(
            allocate("192.168.1.7", "192.168.1.7", NONE).unwrap().to_string(),
            "192.168.1.7"
        );
        assert!(allocate("192.168.1.7", "192.168.1.7", &["192.168.1.7"]).is_err());
    }

    #[test]
    fn allocation_is_deterministic() {
        let held = vec!["10.1.0.2".to_string(), "10.1.0.5".to_string()];
        let first = allocate("10.1.0.2", "10.1.0.10", &held[..]).unwrap();
        for _ in 0..5 {
            assert_eq!(allocate("10.1.0.2", "10.1.0.10", &held[..]).unwrap(), first);
        }
        assert_eq!(first.to_string(), "10.1.0.3");
    }

    #[test]
    fn crosses_octet_boundaries() {
        let ip = allocate("10.0.0.255", "10.0.1.1", &["10.0.0.255"]).unwrap();
        assert_eq!(ip.to_string(), "10.0.1.0");
    }

    #[test]
    fn ignores_garbage_in_exclusion_set() {
        let ip = allocate("10.0.0.1", "10.0.0.2", &["", "not-an-ip"]).unwrap();
        assert_eq!(ip.to_string(), "10.0.0.1");
    }

    #[test]
    fn supports_ipv6_ranges() {
        let ip = allocate("fd00::1", "fd00::3", &["fd00::1"]).unwrap();
        assert_eq!(ip.to_string(), "fd00::2");
    }

    #[test]
    fn inverted_range_is_exhausted() {
        assert!(matches!(
            allocate("10.0.0.5", "10.0.0.1", NONE),
            Err(Error::RangeExhausted { .. })
        ));
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(matches!(
            allocate("10.0.0.x", "10.0.0.1", NONE),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            allocate("10.0.0.1", "fd00::1", NONE),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn range_check_is_numeric() {
        assert!(in_range("10.0.0.10", "10.0.0.2", "10.0.0.20"));
        assert!(in_range("10.0.0.2", "10.0.0.2", "10.0.0.20"));
        assert!(in_range("10.0.0.20", "10.0.0.2", "10.0.0.20"));
        // string comparison would accept this one
        assert!(!in_range("10.0.0.100", "10.0.0.10", "10.0.0.20"));
        assert!(!in_range("10.0.0.1", "10.0.0.2", "10.0.0.20"));
        assert!(!in_range("bogus", "10.0.0.2", "10.0.0.20"));
        assert!(!in_range("fd00::1", "10.0.0.2", "10.0.0.20"));
    }
}
