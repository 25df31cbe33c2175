//! The per-cluster system section.

use serde::{Deserialize, Serialize};

use super::{value_as_num, value_as_str, ParamTarget};
use crate::error::{IcError, IcResult};
use crate::registry::{ids, ParamEntry, ParamValue};
use crate::types::NodeId;

/// Cluster-level settings: name, configuration generation, and the
/// primary cluster server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub system_name: String,
    pub configuration_number: u32,
    pub primary_cs_node: NodeId,
    #[serde(skip)]
    pub mandatory_bits: u64,
}

/// Equality compares configuration values only, not the mandatory-bit
/// bookkeeping.
impl PartialEq for SystemConfig {
    fn eq(&self, other: &Self) -> bool {
        self.system_name == other.system_name
            && self.configuration_number == other.configuration_number
            && self.primary_cs_node == other.primary_cs_node
    }
}

impl ParamTarget for SystemConfig {
    fn set_param(&mut self, entry: &ParamEntry, value: &ParamValue) -> IcResult<()> {
        match entry.wire_id {
            ids::SYSTEM_NAME => self.system_name = value_as_str(value)?.to_string(),
            ids::SYSTEM_CONFIGURATION_NUMBER => {
                self.configuration_number = value_as_num(value)? as u32;
            }
            ids::SYSTEM_PRIMARY_CS_NODE => self.primary_cs_node = value_as_num(value)? as u32,
            id => {
                return Err(IcError::UnknownParameter {
                    ident: id.to_string(),
                })
            }
        }
        if entry.mandatory {
            self.mandatory_bits |= 1u64 << entry.mandatory_bit;
        }
        Ok(())
    }

    fn get_param(&self, entry: &ParamEntry) -> Option<ParamValue> {
        match entry.wire_id {
            ids::SYSTEM_NAME => Some(ParamValue::Str(self.system_name.clone())),
            ids::SYSTEM_CONFIGURATION_NUMBER => {
                Some(ParamValue::Num(u64::from(self.configuration_number)))
            }
            ids::SYSTEM_PRIMARY_CS_NODE => {
                Some(ParamValue::Num(u64::from(self.primary_cs_node)))
            }
            _ => None,
        }
    }

    fn mandatory_bits(&self) -> u64 {
        self.mandatory_bits
    }
}
