// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use gix::ObjectId;
use rstest::rstest;

use super::{Record, StateLog, RECORD_LEN};

fn oid(fill: u8) -> ObjectId {
    ObjectId::try_from(&[fill; 20][..]).unwrap()
}

#[rstest]
fn test_record_roundtrip() {
    let record = Record {
        ino: 0x1234_5678_9abc_def0,
        tag: 1,
        oid: oid(0xab),
        clash: true,
    };
    let encoded = record.encode();
    assert_eq!(encoded.len(), RECORD_LEN);
    let decoded = Record::decode(&encoded, 0).unwrap();
    assert_eq!(decoded, record);
}

#[rstest]
fn test_record_rejects_bad_oid_len() {
    let record = Record {
        ino: 7,
        tag: 0,
        oid: oid(1),
        clash: false,
    };
    let mut encoded = record.encode();
    encoded[9] = 17;
    assert!(Record::decode(&encoded, 0).is_err());
}

#[rstest]
fn test_log_replays_appends() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let path = tmpdir.path().join("ledger");

    let first = Record {
        ino: 42,
        tag: 0,
        oid: oid(0x11),
        clash: false,
    };
    let second = Record {
        ino: 42,
        tag: 0,
        oid: oid(0x11),
        clash: true,
    };

    {
        let (log, records) = StateLog::open(&path).unwrap();
        assert!(records.is_empty());
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        log.sync().unwrap();
    }

    let (_log, records) = StateLog::open(&path).unwrap();
    assert_eq!(records, vec![first, second]);
}

#[rstest]
fn test_log_drops_torn_tail() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let path = tmpdir.path().join("ledger");

    let record = Record {
        ino: 9,
        tag: 3,
        oid: oid(0x22),
        clash: false,
    };
    {
        let (log, _) = StateLog::open(&path).unwrap();
        log.append(&record).unwrap();
        log.sync().unwrap();
    }

    // simulate a crash mid-append
    let mut contents = std::fs::read(&path).unwrap();
    contents.extend_from_slice(&[0xff; RECORD_LEN / 2]);
    std::fs::write(&path, &contents).unwrap();

    let (log, records) = StateLog::open(&path).unwrap();
    assert_eq!(records, vec![record]);

    // the clipped log accepts appends at the record boundary
    log.append(&record).unwrap();
    log.sync().unwrap();
    drop(log);
    let (_log, records) = StateLog::open(&path).unwrap();
    assert_eq!(records, vec![record, record]);
}
