//! Per-endpoint message filtering.
//!
//! Each endpoint carries six filter axes: direction (in/out) crossed with
//! message id, source component, and source system. Every axis holds an
//! optional allow set and an optional block set. When an allow set is
//! present it alone decides the axis; otherwise the block set may drop the
//! message; an empty axis is neutral.
//!
//! Config accepts each set either as an integer list (`[0, 4]`) or as a
//! comma-separated string (`"0,4"`).

use mavlink::MavHeader;
use serde::{de, Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// The axis on which a message was filtered, for per-axis drop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAxis {
    /// Message id allow/block hit.
    MsgId,
    /// Source component id allow/block hit.
    SrcComp,
    /// Source system id allow/block hit.
    SrcSys,
}

fn de_id_set<'de, D, T>(deserializer: D) -> Result<HashSet<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr + Eq + Hash,
    <T as FromStr>::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        List(Vec<T>),
        Csv(String),
    }

    match Repr::<T>::deserialize(deserializer)? {
        Repr::List(values) => Ok(values.into_iter().collect()),
        Repr::Csv(text) => text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<T>().map_err(de::Error::custom))
            .collect(),
    }
}

/// The six filter axes of one endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointFilters {
    /// Message ids allowed for outgoing traffic; non-empty means exclusive.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_msg_id_out: HashSet<u32>,
    /// Message ids blocked for outgoing traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_msg_id_out: HashSet<u32>,
    /// Source component ids allowed for outgoing traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_src_comp_out: HashSet<u8>,
    /// Source component ids blocked for outgoing traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_src_comp_out: HashSet<u8>,
    /// Source system ids allowed for outgoing traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_src_sys_out: HashSet<u8>,
    /// Source system ids blocked for outgoing traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_src_sys_out: HashSet<u8>,

    /// Message ids allowed for incoming traffic; non-empty means exclusive.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_msg_id_in: HashSet<u32>,
    /// Message ids blocked for incoming traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_msg_id_in: HashSet<u32>,
    /// Source component ids allowed for incoming traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_src_comp_in: HashSet<u8>,
    /// Source component ids blocked for incoming traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_src_comp_in: HashSet<u8>,
    /// Source system ids allowed for incoming traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub allow_src_sys_in: HashSet<u8>,
    /// Source system ids blocked for incoming traffic.
    #[serde(default, deserialize_with = "de_id_set")]
    pub block_src_sys_in: HashSet<u8>,
}

/// One axis: allow present decides alone, else block may drop.
fn check_axis<T: Eq + Hash>(value: &T, allow: &HashSet<T>, block: &HashSet<T>) -> bool {
    if !allow.is_empty() {
        return allow.contains(value);
    }
    !block.contains(value)
}

impl EndpointFilters {
    /// Evaluate the ingress-direction axes.
    ///
    /// Returns the axis that filtered the message, or `None` when it passes.
    pub fn check_incoming(&self, header: &MavHeader, msg_id: u32) -> Option<FilterAxis> {
        if !check_axis(&msg_id, &self.allow_msg_id_in, &self.block_msg_id_in) {
            return Some(FilterAxis::MsgId);
        }
        if !check_axis(
            &header.component_id,
            &self.allow_src_comp_in,
            &self.block_src_comp_in,
        ) {
            return Some(FilterAxis::SrcComp);
        }
        if !check_axis(
            &header.system_id,
            &self.allow_src_sys_in,
            &self.block_src_sys_in,
        ) {
            return Some(FilterAxis::SrcSys);
        }
        None
    }

    /// Evaluate the egress-direction axes.
    ///
    /// Returns the axis that filtered the message, or `None` when it passes.
    pub fn check_outgoing(&self, header: &MavHeader, msg_id: u32) -> Option<FilterAxis> {
        if !check_axis(&msg_id, &self.allow_msg_id_out, &self.block_msg_id_out) {
            return Some(FilterAxis::MsgId);
        }
        if !check_axis(
            &header.component_id,
            &self.allow_src_comp_out,
            &self.block_src_comp_out,
        ) {
            return Some(FilterAxis::SrcComp);
        }
        if !check_axis(
            &header.system_id,
            &self.allow_src_sys_out,
            &self.block_src_sys_out,
        ) {
            return Some(FilterAxis::SrcSys);
        }
        None
    }

    /// True when every axis is neutral in both directions.
    pub fn is_empty(&self) -> bool {
        self.allow_msg_id_out.is_empty()
            && self.block_msg_id_out.is_empty()
            && self.allow_src_comp_out.is_empty()
            && self.block_src_comp_out.is_empty()
            && self.allow_src_sys_out.is_empty()
            && self.block_src_sys_out.is_empty()
            && self.allow_msg_id_in.is_empty()
            && self.block_msg_id_in.is_empty()
            && self.allow_src_comp_in.is_empty()
            && self.block_src_comp_in.is_empty()
            && self.allow_src_sys_in.is_empty()
            && self.block_src_sys_in.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn header(sys: u8, comp: u8) -> MavHeader {
        MavHeader {
            system_id: sys,
            component_id: comp,
            sequence: 0,
        }
    }

    #[test]
    fn test_neutral_axes_pass() {
        let filters = EndpointFilters::default();
        assert!(filters.is_empty());
        assert_eq!(filters.check_outgoing(&header(1, 1), 0), None);
        assert_eq!(filters.check_incoming(&header(1, 1), 30), None);
    }

    #[test]
    fn test_allow_list_is_exclusive() {
        let filters = EndpointFilters {
            allow_msg_id_out: HashSet::from([0]),
            ..Default::default()
        };

        assert_eq!(filters.check_outgoing(&header(1, 1), 0), None);
        assert_eq!(
            filters.check_outgoing(&header(1, 1), 1),
            Some(FilterAxis::MsgId)
        );
    }

    #[test]
    fn test_block_list() {
        let filters = EndpointFilters {
            block_msg_id_out: HashSet::from([30]),
            ..Default::default()
        };

        assert_eq!(filters.check_outgoing(&header(1, 1), 0), None);
        assert_eq!(
            filters.check_outgoing(&header(1, 1), 30),
            Some(FilterAxis::MsgId)
        );
    }

    #[test]
    fn test_allow_shadows_block_on_same_axis() {
        // Allow present: block on the same axis is ignored.
        let filters = EndpointFilters {
            allow_msg_id_out: HashSet::from([30]),
            block_msg_id_out: HashSet::from([30]),
            ..Default::default()
        };
        assert_eq!(filters.check_outgoing(&header(1, 1), 30), None);
    }

    #[test]
    fn test_src_axes_report_their_own_verdict() {
        let filters = EndpointFilters {
            block_src_sys_in: HashSet::from([9]),
            block_src_comp_out: HashSet::from([200]),
            ..Default::default()
        };

        assert_eq!(
            filters.check_incoming(&header(9, 1), 0),
            Some(FilterAxis::SrcSys)
        );
        assert_eq!(
            filters.check_outgoing(&header(1, 200), 0),
            Some(FilterAxis::SrcComp)
        );
    }

    #[test]
    fn test_deserialize_list_and_csv_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(flatten)]
            filters: EndpointFilters,
        }

        let from_list: Wrapper =
            toml::from_str("block_msg_id_out = [0, 4]").expect("list form should parse");
        assert_eq!(from_list.filters.block_msg_id_out, HashSet::from([0, 4]));

        let from_csv: Wrapper =
            toml::from_str("block_msg_id_out = \"0, 4,8\"").expect("csv form should parse");
        assert_eq!(from_csv.filters.block_msg_id_out, HashSet::from([0, 4, 8]));

        let bad: Result<Wrapper, _> = toml::from_str("block_msg_id_out = \"0,x\"");
        assert!(bad.is_err(), "non-numeric csv entry should be rejected");
    }
}
