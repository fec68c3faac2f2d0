//! Typed ID and name definitions.
//!
//! IDs are ULID-based for sortability and uniqueness; names are
//! user-controlled labels validated once at construction.

use crate::{define_id, define_name};

// =============================================================================
// Runtime
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(HandleId, "hdl");

// =============================================================================
// User-chosen names
// =============================================================================

define_name!(ResourceName);
define_name!(NodeName);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_roundtrip() {
        let id = InstanceId::new();
        let s = id.to_string();
        let parsed: InstanceId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("inst_"));
    }

    #[test]
    fn test_instance_id_invalid_prefix() {
        let result: Result<InstanceId, _> = "hdl_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_instance_id_missing_separator() {
        let result: Result<InstanceId, _> = "inst01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_instance_id_invalid_ulid() {
        let result: Result<InstanceId, _> = "inst_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_instance_id_json_roundtrip() {
        let id = InstanceId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_sortable() {
        let id1 = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = InstanceId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_id_prefixes_unique() {
        assert_ne!(InstanceId::PREFIX, HandleId::PREFIX);
    }

    #[test]
    fn test_name_accepts_dns_labels() {
        assert!(ResourceName::parse("mpi").is_ok());
        assert!(ResourceName::parse("mpi-workers-0").is_ok());
        assert!(NodeName::parse("gpu-node-3").is_ok());
    }

    #[test]
    fn test_name_rejections() {
        assert!(matches!(ResourceName::parse(""), Err(crate::IdError::Empty)));
        assert!(ResourceName::parse("MPI").unwrap_err().is_name_error());
        assert!(ResourceName::parse("-mpi").unwrap_err().is_name_error());
        assert!(ResourceName::parse("mpi-").unwrap_err().is_name_error());
        assert!(ResourceName::parse("mpi_workers").unwrap_err().is_name_error());
        assert!(matches!(
            ResourceName::parse(&"a".repeat(64)),
            Err(crate::IdError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_name_json_rejects_invalid() {
        let ok: NodeName = serde_json::from_str("\"node-a\"").unwrap();
        assert_eq!(ok.as_str(), "node-a");
        assert!(serde_json::from_str::<NodeName>("\"Node A\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_labels_parse(s in "[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?") {
            let name = ResourceName::parse(&s).unwrap();
            prop_assert_eq!(name.as_str(), s.as_str());
        }

        #[test]
        fn prop_uppercase_rejected(s in "[a-z]{0,10}[A-Z][a-z]{0,10}") {
            prop_assert!(ResourceName::parse(&s).is_err());
        }
    }
}
