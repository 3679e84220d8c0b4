//! Schema versions and the forward-only migration engine shared by every store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::logging::{log, obj, v_int, v_str, Domain, Level, ProfileScope};

/// A (major, minor, patch) marker. Ordering is lexicographic over the triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// 12-byte big-endian encoding used by stores without a relational version row.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.major.to_be_bytes());
        out[4..8].copy_from_slice(&self.minor.to_be_bytes());
        out[8..12].copy_from_slice(&self.patch.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != 12 {
            return None;
        }
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[i..i + 4]);
            u32::from_be_bytes(buf)
        };
        Some(Self::new(word(0), word(4), word(8)))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One migration step. `apply` must use existence-guarded DDL so that
/// replaying it against an up-to-date store changes nothing.
pub struct Patch<H: ?Sized> {
    pub version: SchemaVersion,
    pub name: &'static str,
    pub apply: fn(&H) -> Result<(), StoreError>,
}

impl<H: ?Sized> fmt::Debug for Patch<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// Highest version in a patch list, or zero for an empty list.
pub fn latest<H: ?Sized>(patches: &[Patch<H>]) -> SchemaVersion {
    patches
        .iter()
        .map(|p| p.version)
        .max()
        .unwrap_or(SchemaVersion::ZERO)
}

/// A store that carries a schema version and can be brought forward by patches.
pub trait VersionedStore {
    /// What a patch operates on (a SQL connection, a KV tree, ...).
    type Handle: ?Sized;

    /// Missing or unreadable version information reads as [`SchemaVersion::ZERO`].
    fn current_version(&self) -> SchemaVersion;

    /// Run one patch and record `patch.version` in the same unit of work.
    fn apply_patch(&self, patch: &Patch<Self::Handle>) -> Result<(), StoreError>;

    /// Apply, in ascending order, every patch newer than the current version.
    ///
    /// Stops at the first failure. Patches applied before the failure stay
    /// applied and the version reflects the last one that succeeded.
    fn upgrade(&self, patches: &[Patch<Self::Handle>]) -> Result<SchemaVersion, StoreError> {
        let current = self.current_version();
        log(
            Level::Info,
            Domain::Migrate,
            "migrate.start",
            obj(&[
                ("current", v_str(&current.to_string())),
                ("latest", v_str(&latest(patches).to_string())),
            ]),
        );

        let mut ordered: Vec<&Patch<Self::Handle>> = patches.iter().collect();
        ordered.sort_by_key(|p| p.version);

        let mut reached = current;
        let mut applied = 0i64;
        for patch in ordered {
            if patch.version <= reached {
                continue;
            }
            let _scope = ProfileScope::with_context(
                "migrate.patch",
                &[("version", v_str(&patch.version.to_string()))],
            );
            log(
                Level::Info,
                Domain::Migrate,
                "migrate.apply",
                obj(&[
                    ("version", v_str(&patch.version.to_string())),
                    ("name", v_str(patch.name)),
                ]),
            );
            if let Err(err) = self.apply_patch(patch) {
                log(
                    Level::Error,
                    Domain::Migrate,
                    "migrate.failed",
                    obj(&[
                        ("version", v_str(&patch.version.to_string())),
                        ("stopped_at", v_str(&reached.to_string())),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return Err(match err {
                    StoreError::Migration { .. } => err,
                    other => StoreError::Migration {
                        version: patch.version,
                        reason: other.to_string(),
                    },
                });
            }
            reached = patch.version;
            applied += 1;
        }

        log(
            Level::Info,
            Domain::Migrate,
            "migrate.done",
            obj(&[
                ("version", v_str(&reached.to_string())),
                ("applied", v_int(applied)),
            ]),
        );
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn ordering_is_lexicographic() {
        let a1 = SchemaVersion::new(1, 0, 0);
        let a2 = SchemaVersion::new(1, 0, 1);
        assert!(a1 < a2);
        assert!(!(a2 < a1));

        let b1 = SchemaVersion::new(1, 0, 0);
        let b2 = SchemaVersion::new(1, 0, 0);
        assert!(!(b1 < b2) && !(b2 < b1));

        let mut versions = vec![
            SchemaVersion::new(1, 2, 3),
            SchemaVersion::new(3, 1, 2),
            SchemaVersion::new(1, 1, 1),
            SchemaVersion::new(1, 0, 1),
            SchemaVersion::new(1, 1, 1),
            SchemaVersion::new(1, 0, 1),
        ];
        versions.sort();
        for pair in versions.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(versions[0], SchemaVersion::new(1, 0, 1));
        assert_eq!(versions[5], SchemaVersion::new(3, 1, 2));
    }

    #[test]
    fn bytes_roundtrip_and_reject_garbage() {
        let v = SchemaVersion::new(2, 7, 19);
        assert_eq!(SchemaVersion::from_bytes(&v.to_bytes()), Some(v));
        assert_eq!(SchemaVersion::from_bytes(b"short"), None);
    }

    /// In-memory store recording which patches ran.
    struct Journal {
        version: RefCell<SchemaVersion>,
        ran: RefCell<Vec<String>>,
    }

    impl VersionedStore for Journal {
        type Handle = RefCell<Vec<String>>;

        fn current_version(&self) -> SchemaVersion {
            *self.version.borrow()
        }

        fn apply_patch(&self, patch: &Patch<Self::Handle>) -> Result<(), StoreError> {
            (patch.apply)(&self.ran)?;
            *self.version.borrow_mut() = patch.version;
            Ok(())
        }
    }

    fn note_a(ran: &RefCell<Vec<String>>) -> Result<(), StoreError> {
        ran.borrow_mut().push("a".into());
        Ok(())
    }

    fn note_b(ran: &RefCell<Vec<String>>) -> Result<(), StoreError> {
        ran.borrow_mut().push("b".into());
        Ok(())
    }

    fn fail(_: &RefCell<Vec<String>>) -> Result<(), StoreError> {
        Err(StoreError::Conflict("boom".into()))
    }

    fn journal_at(v: SchemaVersion) -> Journal {
        Journal {
            version: RefCell::new(v),
            ran: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn upgrade_sorts_and_skips_applied() {
        let patches = [
            Patch { version: SchemaVersion::new(1, 1, 0), name: "b", apply: note_b },
            Patch { version: SchemaVersion::new(1, 0, 0), name: "a", apply: note_a },
        ];
        let store = journal_at(SchemaVersion::ZERO);
        assert_eq!(store.upgrade(&patches).unwrap(), SchemaVersion::new(1, 1, 0));
        assert_eq!(*store.ran.borrow(), vec!["a", "b"]);

        // second run is a no-op
        assert_eq!(store.upgrade(&patches).unwrap(), SchemaVersion::new(1, 1, 0));
        assert_eq!(store.ran.borrow().len(), 2);

        let partial = journal_at(SchemaVersion::new(1, 0, 0));
        partial.upgrade(&patches).unwrap();
        assert_eq!(*partial.ran.borrow(), vec!["b"]);
    }

    #[test]
    fn upgrade_stops_at_first_failure() {
        let patches = [
            Patch { version: SchemaVersion::new(1, 0, 0), name: "a", apply: note_a },
            Patch { version: SchemaVersion::new(1, 1, 0), name: "broken", apply: fail },
            Patch { version: SchemaVersion::new(1, 2, 0), name: "b", apply: note_b },
        ];
        let store = journal_at(SchemaVersion::ZERO);
        let err = store.upgrade(&patches).unwrap_err();
        match err {
            StoreError::Migration { version, .. } => assert_eq!(version, SchemaVersion::new(1, 1, 0)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.current_version(), SchemaVersion::new(1, 0, 0));
        assert_eq!(*store.ran.borrow(), vec!["a"]);
    }

    #[test]
    fn latest_of_empty_list_is_zero() {
        let none: [Patch<RefCell<Vec<String>>>; 0] = [];
        assert!(latest(&none).is_zero());
    }
}
