//! Local/remote record reconciliation.

use rlsync_protocol::Record;

/// The result of reconciling a remote record with its local counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Both sides already agree; nothing is written.
    Unchanged,
    /// Write `record` locally.
    Merged {
        /// The reconciled record.
        record: Record,
        /// True if the remote side won; the guid should be tracked so it is
        /// not uploaded again in this cycle.
        track: bool,
    },
}

/// Reconciles a remote record with the local record it maps to.
///
/// Equal payloads never produce a write. Otherwise the side with the later
/// `last_modified` donates its fields, after shifting the remote time by
/// `clock_skew` onto the local clock; ties go to local. The result always
/// carries the remote guid and the local row id.
pub fn reconcile_records(remote: &Record, local: &Record, clock_skew: i64) -> Reconciliation {
    if remote.equal_payloads(local) {
        return Reconciliation::Unchanged;
    }

    let remote_is_newer = remote.last_modified.saturating_add(clock_skew) > local.last_modified;
    let donor = if remote_is_newer { remote } else { local };
    let mut record = donor.copy_with_ids(remote.guid.clone(), local.android_id);
    record.local_version = local.local_version;

    Reconciliation::Merged {
        record,
        track: remote_is_newer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn remote(title: &str, modified: i64) -> Record {
        Record::new("bookmarks")
            .with_guid("remote-guid")
            .with_last_modified(modified)
            .with_field("title", title)
    }

    fn local(title: &str, modified: i64) -> Record {
        Record::new("bookmarks")
            .with_guid("local-guid")
            .with_android_id(7)
            .with_local_version(3)
            .with_last_modified(modified)
            .with_field("title", title)
    }

    #[test]
    fn equal_payloads_are_unchanged() {
        assert_eq!(
            reconcile_records(&remote("a", 10), &local("a", 99), 0),
            Reconciliation::Unchanged
        );
    }

    #[test]
    fn newer_remote_wins_and_is_tracked() {
        let Reconciliation::Merged { record, track } =
            reconcile_records(&remote("new", 200), &local("old", 100), 0)
        else {
            panic!("expected merge");
        };
        assert!(track);
        assert_eq!(record.payload["title"], "new");
        assert_eq!(record.guid.as_deref(), Some("remote-guid"));
        assert_eq!(record.android_id, Some(7));
    }

    #[test]
    fn tie_goes_to_local() {
        let Reconciliation::Merged { record, track } =
            reconcile_records(&remote("r", 100), &local("l", 100), 0)
        else {
            panic!("expected merge");
        };
        assert!(!track);
        assert_eq!(record.payload["title"], "l");
        assert_eq!(record.guid.as_deref(), Some("remote-guid"));
    }

    #[test]
    fn skew_shifts_remote_time() {
        // Server clock runs 50ms ahead: remote 120 is local 70.
        let result = reconcile_records(&remote("r", 120), &local("l", 100), -50);
        assert!(matches!(result, Reconciliation::Merged { track: false, .. }));
    }

    fn title() -> impl Strategy<Value = String> {
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
    }

    proptest! {
        #[test]
        fn equal_payloads_never_write(
            t in title(),
            remote_ts in 0i64..1_000_000,
            local_ts in 0i64..1_000_000,
            skew in -10_000i64..10_000,
        ) {
            prop_assert_eq!(
                reconcile_records(&remote(&t, remote_ts), &local(&t, local_ts), skew),
                Reconciliation::Unchanged
            );
        }

        #[test]
        fn merged_fields_come_from_donor(
            a in title(),
            b in title(),
            remote_ts in 0i64..1_000_000,
            local_ts in 0i64..1_000_000,
            skew in -10_000i64..10_000,
        ) {
            prop_assume!(a != b);
            let r = remote(&a, remote_ts);
            let l = local(&b, local_ts);
            match reconcile_records(&r, &l, skew) {
                Reconciliation::Merged { record, track } => {
                    let remote_wins = remote_ts + skew > local_ts;
                    prop_assert_eq!(track, remote_wins);
                    let donor = if remote_wins { &r } else { &l };
                    prop_assert_eq!(&record.payload, &donor.payload);
                    prop_assert_eq!(record.guid.as_deref(), Some("remote-guid"));
                    prop_assert_eq!(record.android_id, Some(7));
                }
                Reconciliation::Unchanged => prop_assert!(false, "differing payloads must merge"),
            }
        }
    }
}
