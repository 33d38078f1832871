//! Authorization policy registry
//!
//! The single source of truth mapping operation ids to required scopes.
//! Routes reference operations by id; the scope middleware consults this
//! table, and a coverage test keeps the table and the routing surface in
//! lockstep.

/// One API operation and the scopes it requires
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub id: &'static str,
    pub scopes: &'static [&'static str],
}

/// All operations the API surface exposes
pub const OPERATIONS: &[Operation] = &[
    Operation { id: "createIntent", scopes: &["v3:write"] },
    Operation { id: "getSession", scopes: &["v3:read"] },
    Operation { id: "heartbeatSession", scopes: &["v3:write"] },
    Operation { id: "stopSession", scopes: &["v3:write"] },
    Operation { id: "getPlaybackInfo", scopes: &["v3:read"] },
    Operation { id: "hlsOrigin", scopes: &["v3:read"] },
    Operation { id: "systemHealth", scopes: &["v3:read"] },
    Operation { id: "systemStatus", scopes: &["v3:read"] },
    Operation { id: "legacyLineup", scopes: &[] },
    Operation { id: "legacyDiscover", scopes: &[] },
    Operation { id: "legacyLineupStatus", scopes: &[] },
];

/// Operations allowed to carry no scopes (legacy redirect shims)
pub const UNSCOPED_ALLOWLIST: &[&str] = &["legacyLineup", "legacyDiscover", "legacyLineupStatus"];

/// Required scopes for an operation id; `None` for unknown operations
pub fn required_scopes(operation_id: &str) -> Option<&'static [&'static str]> {
    OPERATIONS
        .iter()
        .find(|op| op.id == operation_id)
        .map(|op| op.scopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn operation_ids_are_unique() {
        let ids: HashSet<_> = OPERATIONS.iter().map(|op| op.id).collect();
        assert_eq!(ids.len(), OPERATIONS.len());
    }

    #[test]
    fn only_allowlisted_operations_may_be_unscoped() {
        for op in OPERATIONS {
            if op.scopes.is_empty() {
                assert!(
                    UNSCOPED_ALLOWLIST.contains(&op.id),
                    "operation {} has no scopes and is not allowlisted",
                    op.id
                );
            }
        }
    }

    #[test]
    fn allowlist_entries_exist() {
        for id in UNSCOPED_ALLOWLIST {
            assert!(required_scopes(id).is_some(), "allowlisted {id} not in table");
        }
    }

    #[test]
    fn lookup() {
        assert_eq!(required_scopes("createIntent"), Some(&["v3:write"][..]));
        assert_eq!(required_scopes("nope"), None);
    }
}
