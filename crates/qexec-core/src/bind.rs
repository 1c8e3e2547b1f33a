//! Host directory bindings.

use crate::error::{CoreError, Result};
use std::path::PathBuf;

/// A host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub read_only: bool,
}

/// Parse a `SRC,DEST` option. Only the first comma splits.
///
/// # Errors
/// Returns [`CoreError::MalformedBindSpec`] if either half is missing.
pub fn parse_bind(spec: &str, read_only: bool) -> Result<MountBinding> {
    match spec.split_once(',') {
        Some((src, dest)) if !src.is_empty() && !dest.is_empty() => Ok(MountBinding {
            host_path: PathBuf::from(src),
            guest_path: dest.to_string(),
            read_only,
        }),
        _ => Err(CoreError::MalformedBindSpec(spec.to_string())),
    }
}

/// Resolve every binding, read-only ones first, keeping order.
///
/// Nothing is returned unless every spec parses.
pub fn resolve_bindings(bind_ro: &[String], bind_rw: &[String]) -> Result<Vec<MountBinding>> {
    let ro = bind_ro.iter().map(|s| parse_bind(s, true));
    let rw = bind_rw.iter().map(|s| parse_bind(s, false));
    ro.chain(rw).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        let binding = parse_bind("/host/a,/guest/a", true).unwrap();
        assert_eq!(binding.host_path, PathBuf::from("/host/a"));
        assert_eq!(binding.guest_path, "/guest/a");
        assert!(binding.read_only);
    }

    #[test]
    fn test_only_first_comma_splits() {
        let binding = parse_bind("/host/a,/guest/with,comma", false).unwrap();
        assert_eq!(binding.guest_path, "/guest/with,comma");
    }

    #[test]
    fn test_malformed_specs() {
        for spec in ["/host/only", ",/guest", "/host,", ""] {
            let err = parse_bind(spec, true).unwrap_err();
            assert!(matches!(err, CoreError::MalformedBindSpec(ref s) if s == spec));
        }
    }

    #[test]
    fn test_resolve_order() {
        let ro = vec!["/a,/ga".to_string()];
        let rw = vec!["/b,/gb".to_string(), "/c,/gc".to_string()];
        let bindings = resolve_bindings(&ro, &rw).unwrap();
        let guests: Vec<_> = bindings.iter().map(|b| b.guest_path.as_str()).collect();
        assert_eq!(guests, vec!["/ga", "/gb", "/gc"]);
        assert!(bindings[0].read_only);
        assert!(!bindings[2].read_only);
    }

    #[test]
    fn test_one_bad_spec_yields_nothing() {
        let ro = vec!["/a,/ga".to_string()];
        let rw = vec!["/b-without-dest".to_string()];
        assert!(matches!(
            resolve_bindings(&ro, &rw),
            Err(CoreError::MalformedBindSpec(_))
        ));
    }
}
