//! Verification helpers for kernel operation sequences
//!
//! Wraps the in-memory platform's operation log with assertions on attribute
//! writes and their relative order.

use netdev_platform::{InMemoryPlatform, PlatformOp};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected write {name}={value:?} not found")]
    WriteNotFound { name: String, value: String },

    #[error("Unexpected write {name}={value:?}")]
    UnexpectedWrite { name: String, value: String },

    #[error("Write {name}={value:?} is out of order (expected after index {after})")]
    OutOfOrder {
        name: String,
        value: String,
        after: usize,
    },

    #[error("Expected operation {op} not found")]
    OpNotFound { op: String },

    #[error("Operation {later} happened before {earlier}")]
    OpOrder { earlier: String, later: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Snapshot of the platform operation log
#[derive(Debug, Clone)]
pub struct OpLog {
    ops: Vec<PlatformOp>,
}

impl OpLog {
    /// Capture the current log of `platform`
    pub fn capture(platform: &InMemoryPlatform) -> Self {
        Self {
            ops: platform.ops(),
        }
    }

    /// Wrap an existing list of operations
    pub fn from_ops(ops: Vec<PlatformOp>) -> Self {
        Self { ops }
    }

    /// All captured operations
    pub fn ops(&self) -> &[PlatformOp] {
        &self.ops
    }

    /// Attribute writes on `ifindex`, in order
    pub fn attribute_writes(&self, ifindex: i32) -> Vec<(String, String)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PlatformOp::SetAttribute {
                    ifindex: idx,
                    name,
                    value,
                } if *idx == ifindex => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Values written to one attribute on `ifindex`, in order
    pub fn values_of(&self, ifindex: i32, name: &str) -> Vec<String> {
        self.attribute_writes(ifindex)
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }

    /// Verify that `name=value` was written
    pub fn assert_written(&self, ifindex: i32, name: &str, value: &str) -> VerifyResult<()> {
        if self.values_of(ifindex, name).iter().any(|v| v == value) {
            Ok(())
        } else {
            Err(VerificationError::WriteNotFound {
                name: name.to_string(),
                value: value.to_string(),
            })
        }
    }

    /// Verify that `name` was never written
    pub fn assert_not_written(&self, ifindex: i32, name: &str) -> VerifyResult<()> {
        match self.values_of(ifindex, name).into_iter().next() {
            None => Ok(()),
            Some(value) => Err(VerificationError::UnexpectedWrite {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Verify that the expected writes appear in this relative order
    /// (other writes may be interleaved)
    pub fn assert_write_order(&self, ifindex: i32, expected: &[(&str, &str)]) -> VerifyResult<()> {
        let writes = self.attribute_writes(ifindex);
        let mut cursor = 0;

        for (name, value) in expected {
            let found = writes[cursor..]
                .iter()
                .position(|(n, v)| n == name && v == value);
            match found {
                Some(offset) => cursor += offset + 1,
                None => {
                    let exists = writes.iter().any(|(n, v)| n == name && v == value);
                    return Err(if exists {
                        VerificationError::OutOfOrder {
                            name: name.to_string(),
                            value: value.to_string(),
                            after: cursor,
                        }
                    } else {
                        VerificationError::WriteNotFound {
                            name: name.to_string(),
                            value: value.to_string(),
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Index of the first occurrence of `op`
    pub fn position(&self, op: &PlatformOp) -> Option<usize> {
        self.ops.iter().position(|o| o == op)
    }

    /// Index of the last occurrence of `op`
    pub fn last_position(&self, op: &PlatformOp) -> Option<usize> {
        self.ops.iter().rposition(|o| o == op)
    }

    /// Verify that some occurrence of `later` follows the first `earlier`
    pub fn assert_op_after(&self, earlier: &PlatformOp, later: &PlatformOp) -> VerifyResult<()> {
        let first = self.position(earlier).ok_or_else(|| VerificationError::OpNotFound {
            op: format!("{:?}", earlier),
        })?;
        let last = self.last_position(later).ok_or_else(|| VerificationError::OpNotFound {
            op: format!("{:?}", later),
        })?;
        if last > first {
            Ok(())
        } else {
            Err(VerificationError::OpOrder {
                earlier: format!("{:?}", earlier),
                later: format!("{:?}", later),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(name: &str, value: &str) -> PlatformOp {
        PlatformOp::SetAttribute {
            ifindex: 5,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn log() -> OpLog {
        OpLog::from_ops(vec![
            PlatformOp::LinkDown { ifindex: 5 },
            write("mode", "active-backup"),
            write("miimon", "100"),
            write("primary", "eth0"),
            PlatformOp::LinkUp { ifindex: 5 },
        ])
    }

    #[test]
    fn test_write_order() {
        let log = log();
        assert!(log
            .assert_write_order(5, &[("mode", "active-backup"), ("primary", "eth0")])
            .is_ok());
        assert!(matches!(
            log.assert_write_order(5, &[("primary", "eth0"), ("mode", "active-backup")]),
            Err(VerificationError::OutOfOrder { .. })
        ));
        assert!(matches!(
            log.assert_write_order(5, &[("miimon", "200")]),
            Err(VerificationError::WriteNotFound { .. })
        ));
    }

    #[test]
    fn test_written_and_not_written() {
        let log = log();
        assert!(log.assert_written(5, "miimon", "100").is_ok());
        assert!(log.assert_not_written(5, "arp_interval").is_ok());
        assert!(log.assert_not_written(6, "mode").is_ok());
        assert!(log.assert_not_written(5, "mode").is_err());
    }

    #[test]
    fn test_op_order() {
        let log = log();
        let down = PlatformOp::LinkDown { ifindex: 5 };
        let up = PlatformOp::LinkUp { ifindex: 5 };
        assert!(log.assert_op_after(&down, &up).is_ok());
        assert!(log.assert_op_after(&up, &down).is_err());
    }
}
