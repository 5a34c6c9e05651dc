//! Typed keyspace.
//!
//! Every value the core stores lives under a [`StoreKey`]. Keys render to
//! backend strings deterministically and parse back, so maintenance passes
//! that walk `list_keys` can recognise what they find. Name segments are
//! restricted by [`validate_name`] and index values are hex-encoded, so no
//! two distinct keys render to the same string.
//!
//! | Key | Rendered |
//! |-----|----------|
//! | `Primary(id)` | `rec:<id>` |
//! | `Chunk(id, n)` | `rec:<id>:chunk:<n>` |
//! | `Meta(id)` | `rec:<id>:meta` |
//! | `Index { name, value }` | `idx:<name>:<hex value>` |
//! | `IndexPage { name, value, page }` | `idx:<name>:<hex value>:page:<n>` |
//! | `Quota { op, window }` | `quota:<op>:<minute\|day>:<window start ms>` |
//! | `CleanupSchedule(op)` | `sys:quota-cleanup:<op>` |
//! | `CleanupBucket { op, due_ms }` | `sys:quota-cleanup:<op>:<due ms>` |
//! | `Outbox(id)` | `outbox:<id>` |
//! | `Counter(name)` | `ctr:<name>` |

use deskvault_common::{validate_name, NameError, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const OUTBOX_PREFIX: &str = "outbox:";
pub const QUOTA_PREFIX: &str = "quota:";
pub const CLEANUP_PREFIX: &str = "sys:quota-cleanup:";


/// Granularity of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Minute,
    Day,
}

impl WindowKind {
    pub const fn len_ms(self) -> u64 {
        match self {
            Self::Minute => 60_000,
            Self::Day => 86_400_000,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Day => "day",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed time bucket: `[start_ms, start_ms + kind.len_ms())`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaWindow {
    pub kind: WindowKind,
    pub start_ms: u64,
}

impl QuotaWindow {
    /// The window of `kind` that contains `now_ms`.
    pub fn containing(kind: WindowKind, now_ms: u64) -> Self {
        Self {
            kind,
            start_ms: now_ms - now_ms % kind.len_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Primary(RecordId),
    Chunk(RecordId, u32),
    Meta(RecordId),
    Index { name: String, value: String },
    IndexPage { name: String, value: String, page: u32 },
    Quota { op: String, window: QuotaWindow },
    /// Sweep cursor over one operation's cleanup buckets.
    CleanupSchedule(String),
    /// Counters of one operation that expire at `due_ms`.
    CleanupBucket { op: String, due_ms: u64 },
    Outbox(String),
    Counter(String),
}

impl StoreKey {
    pub fn index(name: &str, value: &str) -> Result<Self, NameError> {
        validate_name("index name", name)?;
        Ok(Self::Index {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn index_page(name: &str, value: &str, page: u32) -> Result<Self, NameError> {
        validate_name("index name", name)?;
        Ok(Self::IndexPage {
            name: name.to_string(),
            value: value.to_string(),
            page,
        })
    }

    pub fn quota(op: &str, window: QuotaWindow) -> Result<Self, NameError> {
        validate_name("operation name", op)?;
        Ok(Self::Quota {
            op: op.to_string(),
            window,
        })
    }

    pub fn cleanup_schedule(op: &str) -> Result<Self, NameError> {
        validate_name("operation name", op)?;
        Ok(Self::CleanupSchedule(op.to_string()))
    }

    pub fn cleanup_bucket(op: &str, due_ms: u64) -> Result<Self, NameError> {
        validate_name("operation name", op)?;
        Ok(Self::CleanupBucket {
            op: op.to_string(),
            due_ms,
        })
    }

    pub fn outbox(id: &str) -> Result<Self, NameError> {
        validate_name("message id", id)?;
        Ok(Self::Outbox(id.to_string()))
    }

    pub fn counter(name: &str) -> Result<Self, NameError> {
        validate_name("counter name", name)?;
        Ok(Self::Counter(name.to_string()))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary(id) => write!(f, "rec:{}", id),
            Self::Chunk(id, n) => write!(f, "rec:{}:chunk:{}", id, n),
            Self::Meta(id) => write!(f, "rec:{}:meta", id),
            Self::Index { name, value } => write!(f, "idx:{}:{}", name, hex::encode(value)),
            Self::IndexPage { name, value, page } => {
                write!(f, "idx:{}:{}:page:{}", name, hex::encode(value), page)
            }
            Self::Quota { op, window } => {
                write!(f, "quota:{}:{}:{}", op, window.kind, window.start_ms)
            }
            Self::CleanupSchedule(op) => write!(f, "sys:quota-cleanup:{}", op),
            Self::CleanupBucket { op, due_ms } => write!(f, "sys:quota-cleanup:{}:{}", op, due_ms),
            Self::Outbox(id) => write!(f, "outbox:{}", id),
            Self::Counter(name) => write!(f, "ctr:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised storage key {0:?}")]
pub struct KeyError(pub String);

impl FromStr for StoreKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KeyError(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        let id = |raw: &str| RecordId::new(raw).map_err(|_| bad());
        let num = |raw: &str| raw.parse::<u32>().map_err(|_| bad());
        let name = |kind: &'static str, raw: &str| {
            validate_name(kind, raw)
                .map(|()| raw.to_string())
                .map_err(|_| bad())
        };
        let unhex = |raw: &str| {
            hex::decode(raw)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(bad)
        };

        match parts.as_slice() {
            ["rec", rid] => Ok(Self::Primary(id(rid)?)),
            ["rec", rid, "chunk", n] => Ok(Self::Chunk(id(rid)?, num(n)?)),
            ["rec", rid, "meta"] => Ok(Self::Meta(id(rid)?)),
            ["idx", n, v] => Ok(Self::Index {
                name: name("index name", n)?,
                value: unhex(v)?,
            }),
            ["idx", n, v, "page", p] => Ok(Self::IndexPage {
                name: name("index name", n)?,
                value: unhex(v)?,
                page: num(p)?,
            }),
            ["quota", op, kind, start] => {
                let kind = match *kind {
                    "minute" => WindowKind::Minute,
                    "day" => WindowKind::Day,
                    _ => return Err(bad()),
                };
                let start_ms = start.parse::<u64>().map_err(|_| bad())?;
                Ok(Self::Quota {
                    op: name("operation name", op)?,
                    window: QuotaWindow { kind, start_ms },
                })
            }
            ["sys", "quota-cleanup", op] => {
                Ok(Self::CleanupSchedule(name("operation name", op)?))
            }
            ["sys", "quota-cleanup", op, due] => Ok(Self::CleanupBucket {
                op: name("operation name", op)?,
                due_ms: due.parse::<u64>().map_err(|_| bad())?,
            }),
            ["outbox", mid] => Ok(Self::Outbox(name("message id", mid)?)),
            ["ctr", n] => Ok(Self::Counter(name("counter name", n)?)),
            _ => Err(bad()),
        }
    }
}
