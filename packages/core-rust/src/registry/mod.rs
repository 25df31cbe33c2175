//! The process-wide configuration parameter registry.
//!
//! One immutable table of every parameter the system knows about, keyed
//! both by a dense index and by the sparse wire config id. Built once on
//! first use; duplicate ids, duplicate names, and colliding mandatory
//! bits abort the process since they are build-time invariants.

pub mod entry;
mod table;

use std::collections::HashMap;
use std::sync::OnceLock;

pub use entry::{
    ChangeClass, ParamDefault, ParamEntry, ParamType, ParamValue, VersionWindow,
};
pub use table::ids;

use crate::error::{IcError, IcResult};
use crate::types::{base_version, extended_version, NodeKind};

/// Highest wire config id representable in a key word.
pub const MAX_CONFIG_ID: u32 = 16_384;

/// The registry: every entry plus the id and name maps and the per-kind
/// mandatory masks.
#[derive(Debug)]
pub struct Registry {
    entries: Vec<ParamEntry>,
    by_wire_id: HashMap<u32, usize>,
    by_name: HashMap<&'static str, usize>,
    /// Indexed by `NodeKind::wire_value()`.
    mandatory_masks: [u64; 10],
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry, built on first call.
    ///
    /// # Panics
    ///
    /// Panics on duplicate wire id, duplicate name, out-of-range wire id,
    /// or overlapping mandatory bits within one kind. These cannot happen
    /// at runtime, only when the table itself is edited incorrectly.
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(Registry::build)
    }

    fn build() -> Registry {
        let entries = table::install_entries();
        let mut by_wire_id = HashMap::with_capacity(entries.len());
        let mut by_name = HashMap::with_capacity(entries.len());
        let mut mandatory_masks = [0u64; 10];

        for (index, entry) in entries.iter().enumerate() {
            assert!(
                entry.wire_id < MAX_CONFIG_ID,
                "wire id {} of `{}` out of range",
                entry.wire_id,
                entry.name
            );
            assert!(
                by_wire_id.insert(entry.wire_id, index).is_none(),
                "duplicate wire id {} (`{}`)",
                entry.wire_id,
                entry.name
            );
            assert!(
                by_name.insert(entry.name, index).is_none(),
                "duplicate parameter name `{}`",
                entry.name
            );
            if entry.mandatory {
                assert!(entry.mandatory_bit < 64, "mandatory bit of `{}`", entry.name);
                let bit = 1u64 << entry.mandatory_bit;
                for kind_value in 0..10u32 {
                    if entry.kinds & (1 << kind_value) != 0 {
                        let mask = &mut mandatory_masks[kind_value as usize];
                        assert!(
                            *mask & bit == 0,
                            "mandatory bit {} reused within kind {} (`{}`)",
                            entry.mandatory_bit,
                            kind_value,
                            entry.name
                        );
                        *mask |= bit;
                    }
                }
            }
        }

        tracing::debug!(params = entries.len(), "parameter registry built");
        Registry {
            entries,
            by_wire_id,
            by_name,
            mandatory_masks,
        }
    }

    /// Looks up a parameter by its sparse wire config id.
    pub fn lookup_by_wire_id(&self, wire_id: u32) -> IcResult<&ParamEntry> {
        self.by_wire_id
            .get(&wire_id)
            .map(|&index| &self.entries[index])
            .ok_or_else(|| IcError::UnknownParameter {
                ident: wire_id.to_string(),
            })
    }

    /// Looks up a parameter by name (case-sensitive).
    pub fn lookup_by_name(&self, name: &str) -> IcResult<&ParamEntry> {
        self.by_name
            .get(name)
            .map(|&index| &self.entries[index])
            .ok_or_else(|| IcError::UnknownParameter {
                ident: name.to_string(),
            })
    }

    /// All entries in dense index order. Encoding iterates this order so
    /// output is deterministic.
    pub fn iter(&self) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter()
    }

    /// The mandatory mask a config struct of `kind` must carry after load.
    #[must_use]
    pub fn mandatory_mask(&self, kind: NodeKind) -> u64 {
        self.mandatory_masks[kind.wire_value() as usize]
    }

    /// Names of the mandatory parameters of `kind` whose bits are missing
    /// from `bits`. Used to compose missing-parameter diagnostics.
    #[must_use]
    pub fn missing_mandatory_names(&self, kind: NodeKind, bits: u64) -> Vec<&'static str> {
        let missing = self.mandatory_mask(kind) & !bits;
        self.entries
            .iter()
            .filter(|e| {
                e.mandatory
                    && e.applies_to_kind(kind)
                    && missing & (1u64 << e.mandatory_bit) != 0
            })
            .map(|e| e.name)
            .collect()
    }

    /// True iff `entry` applies to `kind` at `version`: the kind bit must
    /// be set, the version window must contain both version parts, and an
    /// iClaustron-only parameter needs a non-zero extended version.
    #[must_use]
    pub fn applicable_to(&self, entry: &ParamEntry, kind: NodeKind, version: u32) -> bool {
        let base = base_version(version);
        let extended = extended_version(version);
        entry.applies_to_kind(kind)
            && entry.versions.contains(base, extended)
            && (!entry.iclaustron_only || extended != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{pack_version, NodeKind, NDB_VERSION, NODE_KINDS};

    #[test]
    fn registry_builds_once() {
        let a = Registry::global();
        let b = Registry::global();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn lookup_by_wire_id_and_name_agree() {
        let reg = Registry::global();
        for entry in reg.iter() {
            let by_id = reg.lookup_by_wire_id(entry.wire_id).unwrap();
            let by_name = reg.lookup_by_name(entry.name).unwrap();
            assert_eq!(by_id.name, by_name.name);
            assert_eq!(by_id.wire_id, by_name.wire_id);
        }
    }

    #[test]
    fn unknown_parameter_errors() {
        let reg = Registry::global();
        assert!(matches!(
            reg.lookup_by_wire_id(15_999),
            Err(IcError::UnknownParameter { .. })
        ));
        assert!(matches!(
            reg.lookup_by_name("no_such_parameter"),
            Err(IcError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn node_id_and_hostname_mandatory_everywhere() {
        let reg = Registry::global();
        for kind in NODE_KINDS {
            let mask = reg.mandatory_mask(kind);
            assert!(mask & 0b11 == 0b11, "kind {kind:?} mask {mask:#x}");
        }
    }

    #[test]
    fn cluster_server_has_extra_mandatory_port() {
        let reg = Registry::global();
        assert_eq!(reg.mandatory_mask(NodeKind::ClusterServer), 0b111);
        assert_eq!(reg.mandatory_mask(NodeKind::Client), 0b11);
        assert_eq!(reg.mandatory_mask(NodeKind::Comm), 0b111);
        assert_eq!(reg.mandatory_mask(NodeKind::System), 0b1);
    }

    #[test]
    fn missing_mandatory_names_reports_unset_bits() {
        let reg = Registry::global();
        let names = reg.missing_mandatory_names(NodeKind::ClusterServer, 0b001);
        assert_eq!(names, vec!["hostname", "cluster_server_port_number"]);
        assert!(reg
            .missing_mandatory_names(NodeKind::ClusterServer, 0b111)
            .is_empty());
    }

    #[test]
    fn applicability_honors_kind_mask() {
        let reg = Registry::global();
        let entry = reg.lookup_by_name("filesystem_path").unwrap();
        let v = pack_version(NDB_VERSION, 1);
        assert!(reg.applicable_to(entry, NodeKind::DataServer, v));
        assert!(!reg.applicable_to(entry, NodeKind::Client, v));
    }

    #[test]
    fn iclaustron_only_needs_extended_version() {
        let reg = Registry::global();
        let entry = reg.lookup_by_name("socket_max_wait_in_nanos").unwrap();
        let classic = NDB_VERSION & crate::types::IC_BASE_VERSION_MASK;
        let extended = pack_version(NDB_VERSION, 1);
        assert!(!reg.applicable_to(entry, NodeKind::Comm, classic));
        assert!(reg.applicable_to(entry, NodeKind::Comm, extended));
    }

    #[test]
    fn dynamic_port_parameter_is_406() {
        let reg = Registry::global();
        let entry = reg.lookup_by_wire_id(ids::SERVER_PORT_NUMBER).unwrap();
        assert_eq!(entry.name, "server_port_number");
        assert_eq!(entry.change, ChangeClass::Online);
    }

    #[test]
    fn deprecated_entry_still_resolves() {
        let reg = Registry::global();
        let entry = reg.lookup_by_name("socket_bind_address").unwrap();
        assert!(entry.deprecated);
    }
}
