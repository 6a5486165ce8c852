//! Capacity types for EKS managed node groups, and the arithmetic that takes them to zero and back.
use crate::constants::{FALLBACK_MAX_FLOOR, FALLBACK_MAX_MULTIPLIER, NODEGROUP_MIN_MAX_SIZE};

use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::fmt;

/// Opaque name of the target cluster. Every piece of persisted state is scoped by it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterIdentity(String);

impl ClusterIdentity {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ClusterIdentity(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterIdentity {
    fn from(name: &str) -> Self {
        ClusterIdentity::new(name)
    }
}

/// The scaling configuration of a node group.
///
/// EKS rejects `max == 0`, so every capacity this crate computes keeps `max >= 1` even when
/// `min` and `desired` are zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupCapacity {
    pub min: i32,
    pub max: i32,
    pub desired: i32,
}

impl NodeGroupCapacity {
    pub fn new(min: i32, max: i32, desired: i32) -> Self {
        NodeGroupCapacity { min, max, desired }
    }

    /// The capacity a group is given when scaled down: nothing running, but a legal max.
    pub fn scaled_to_zero(&self) -> Self {
        NodeGroupCapacity {
            min: 0,
            desired: 0,
            max: max(NODEGROUP_MIN_MAX_SIZE, self.max),
        }
    }

    /// Whether the group already has no running capacity.
    pub fn is_scaled_to_zero(&self) -> bool {
        self.min == 0 && self.desired == 0
    }

    /// Computes the capacity to restore, given what was stored at scale-down (if anything) and the
    /// caller's minimum node count.
    pub fn restore_target(stored: Option<&NodeGroupCapacity>, min_nodes: i32) -> Self {
        match stored {
            Some(stored) => {
                let desired = max(stored.desired, min_nodes);
                NodeGroupCapacity {
                    min: max(stored.min, min_nodes),
                    desired,
                    max: max(max(stored.max, desired), NODEGROUP_MIN_MAX_SIZE),
                }
            }
            None => NodeGroupCapacity {
                min: min_nodes,
                desired: min_nodes,
                max: max(
                    max(min_nodes * FALLBACK_MAX_MULTIPLIER, FALLBACK_MAX_FLOOR),
                    NODEGROUP_MIN_MAX_SIZE,
                ),
            },
        }
    }
}

impl fmt::Display for NodeGroupCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min={}, max={}, desired={}",
            self.min, self.max, self.desired
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scaled_to_zero_keeps_max_legal() {
        let test_cases = vec![
            (NodeGroupCapacity::new(2, 6, 3), NodeGroupCapacity::new(0, 6, 0)),
            (NodeGroupCapacity::new(1, 4, 2), NodeGroupCapacity::new(0, 4, 0)),
            (NodeGroupCapacity::new(0, 0, 0), NodeGroupCapacity::new(0, 1, 0)),
            (NodeGroupCapacity::new(0, -3, 0), NodeGroupCapacity::new(0, 1, 0)),
        ];

        for (original, expected) in test_cases {
            let scaled = original.scaled_to_zero();
            assert_eq!(scaled, expected);
            assert!(scaled.max >= 1);
            assert!(scaled.is_scaled_to_zero());
        }
    }

    #[test]
    fn test_restore_target_with_stored_record() {
        let test_cases = vec![
            (
                NodeGroupCapacity::new(2, 6, 3),
                2,
                NodeGroupCapacity::new(2, 6, 3),
            ),
            (
                NodeGroupCapacity::new(1, 4, 2),
                2,
                NodeGroupCapacity::new(2, 4, 2),
            ),
            // desired raised above the stored max drags max along
            (
                NodeGroupCapacity::new(1, 2, 1),
                5,
                NodeGroupCapacity::new(5, 5, 5),
            ),
        ];

        for (stored, min_nodes, expected) in test_cases {
            let target = NodeGroupCapacity::restore_target(Some(&stored), min_nodes);
            assert_eq!(target, expected);
            assert!(target.min >= stored.min.max(min_nodes));
            assert!(target.desired >= stored.desired.max(min_nodes));
            assert!(target.max >= target.desired);
        }
    }

    #[test]
    fn test_restore_target_without_stored_record() {
        assert_eq!(
            NodeGroupCapacity::restore_target(None, 4),
            NodeGroupCapacity::new(4, 12, 4)
        );
        assert_eq!(
            NodeGroupCapacity::restore_target(None, 2),
            NodeGroupCapacity::new(2, 10, 2)
        );
        assert_eq!(
            NodeGroupCapacity::restore_target(None, 0),
            NodeGroupCapacity::new(0, 10, 0)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            NodeGroupCapacity::new(0, 6, 0).to_string(),
            "min=0, max=6, desired=0"
        );
    }
}
