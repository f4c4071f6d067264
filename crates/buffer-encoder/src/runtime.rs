use std::collections::{BTreeMap, BTreeSet};

use crate::{config::RuntimeConfig, device::DeviceParameters};

/// Per-frame actions keyed by source frame ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSchedule {
    request_sync: BTreeSet<u64>,
    bitrate: BTreeMap<u64, u64>,
    drop: BTreeSet<u64>,
}

impl RuntimeSchedule {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            request_sync: config.request_sync.iter().copied().collect(),
            bitrate: config
                .video_bitrate
                .iter()
                .map(|change| (change.frame, change.bitrate))
                .collect(),
            drop: config.drop.iter().copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request_sync.is_empty() && self.bitrate.is_empty() && self.drop.is_empty()
    }

    pub fn drops(&self, ordinal: u64) -> bool {
        self.drop.contains(&ordinal)
    }

    pub fn parameters_at(&self, ordinal: u64) -> Option<DeviceParameters> {
        let params = DeviceParameters {
            request_sync: self.request_sync.contains(&ordinal),
            bitrate: self.bitrate.get(&ordinal).copied(),
        };

        (!params.is_empty()).then_some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BitrateChange;

    #[test]
    fn looks_up_actions_by_ordinal() {
        let schedule = RuntimeSchedule::from_config(&RuntimeConfig {
            request_sync: vec![10],
            video_bitrate: vec![BitrateChange {
                frame: 10,
                bitrate: 500_000,
            }],
            drop: vec![3, 4],
        });

        assert!(schedule.drops(3));
        assert!(!schedule.drops(5));
        assert_eq!(schedule.parameters_at(2), None);
        assert_eq!(
            schedule.parameters_at(10),
            Some(DeviceParameters {
                request_sync: true,
                bitrate: Some(500_000),
            })
        );
    }
}
