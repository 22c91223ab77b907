//! Mask and Pattern Filters

use passthru_protocol::limits::MAX_FILTER_MSG_LEN;
use passthru_protocol::PassThruMsg;
use serde::{Deserialize, Serialize};

use crate::FilterError;

/// Filter kinds (J2534 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FilterKind {
    Pass = 0x01,
    Block = 0x02,
    FlowControl = 0x03,
}

impl TryFrom<u32> for FilterKind {
    type Error = FilterError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(FilterKind::Pass),
            0x02 => Ok(FilterKind::Block),
            0x03 => Ok(FilterKind::FlowControl),
            other => Err(FilterError::InvalidKind(other)),
        }
    }
}

/// Who installed a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOwner {
    /// Installed through StartMsgFilter
    Api,
    /// Installed by the protocol variant and removed with its teardown
    Variant,
}

/// A single filter entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFilter {
    kind: FilterKind,
    mask: Vec<u8>,
    pattern: Vec<u8>,
    flow_control: Option<PassThruMsg>,
}

impl MsgFilter {
    /// Build a validated filter
    ///
    /// A flow control message is required for `FlowControl` filters and
    /// rejected for the other kinds.
    pub fn new(
        kind: FilterKind,
        mask: Vec<u8>,
        pattern: Vec<u8>,
        flow_control: Option<PassThruMsg>,
    ) -> Result<Self, FilterError> {
        if mask.len() != pattern.len() {
            return Err(FilterError::InvalidFilter(format!(
                "mask is {} bytes but pattern is {}",
                mask.len(),
                pattern.len()
            )));
        }
        if mask.is_empty() || mask.len() > MAX_FILTER_MSG_LEN {
            return Err(FilterError::InvalidFilter(format!(
                "mask length {} outside 1..={}",
                mask.len(),
                MAX_FILTER_MSG_LEN
            )));
        }
        match (kind, &flow_control) {
            (FilterKind::FlowControl, None) => return Err(FilterError::MissingFlowControl),
            (FilterKind::Pass | FilterKind::Block, Some(_)) => {
                return Err(FilterError::UnexpectedFlowControl)
            }
            _ => {}
        }
        Ok(Self {
            kind,
            mask,
            pattern,
            flow_control,
        })
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Response message of a flow control filter
    pub fn flow_control(&self) -> Option<&PassThruMsg> {
        self.flow_control.as_ref()
    }

    /// Whether `data` matches the masked pattern
    ///
    /// Data shorter than the mask never matches.
    pub fn matches(&self, data: &[u8]) -> bool {
        if data.len() < self.mask.len() {
            return false;
        }
        self.mask
            .iter()
            .zip(&self.pattern)
            .zip(data)
            .all(|((mask, pattern), byte)| byte & mask == pattern & mask)
    }

    /// Masked pattern, used to compare flow control filters
    pub(crate) fn masked_pattern(&self) -> Vec<u8> {
        self.mask
            .iter()
            .zip(&self.pattern)
            .map(|(mask, pattern)| mask & pattern)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passthru_protocol::ProtocolId;

    #[test]
    fn test_matches_masked_bytes() {
        let filter = MsgFilter::new(
            FilterKind::Pass,
            vec![0xFF, 0x0F],
            vec![0x01, 0x02],
            None,
        )
        .unwrap();

        assert!(filter.matches(&[0x01, 0x02]));
        assert!(filter.matches(&[0x01, 0xF2, 0x99]));
        assert!(!filter.matches(&[0x01, 0x03]));
        assert!(!filter.matches(&[0x01]));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = MsgFilter::new(FilterKind::Block, vec![0xFF], vec![0x01, 0x02], None)
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidFilter(_)));

        let err = MsgFilter::new(FilterKind::Block, vec![0xFF; 13], vec![0x00; 13], None)
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidFilter(_)));
    }

    #[test]
    fn test_flow_control_presence_checked() {
        let err = MsgFilter::new(FilterKind::FlowControl, vec![0xFF], vec![0x01], None)
            .unwrap_err();
        assert_eq!(err, FilterError::MissingFlowControl);

        let fc = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[]).unwrap();
        let err = MsgFilter::new(FilterKind::Pass, vec![0xFF], vec![0x01], Some(fc))
            .unwrap_err();
        assert_eq!(err, FilterError::UnexpectedFlowControl);
    }

    #[test]
    fn test_kind_from_raw() {
        assert_eq!(FilterKind::try_from(2).unwrap(), FilterKind::Block);
        assert_eq!(FilterKind::try_from(9), Err(FilterError::InvalidKind(9)));
    }
}
