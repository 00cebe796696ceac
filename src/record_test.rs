use arbitrary::{unstructured::Unstructured, Arbitrary};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::block;

fn oid(fill: u8) -> Oid {
    let mut bytes = [0; ID_LENGTH];
    bytes[ID_LENGTH - 1] = fill;
    Oid::new(bytes)
}

#[test]
fn test_oid() {
    assert!(Oid::zero().is_zero());
    assert!(!oid(1).is_zero());
    assert_eq!(oid(1).as_bytes()[ID_LENGTH - 1], 1);
    assert!(oid(1) < oid(2));
    assert_eq!(
        format!("{}", oid(0xab)),
        "00000000000000000000000000000000000000ab"
    );
}

#[test]
fn test_ref_value_kinds() {
    let cases = [
        (RefRecord::deletion("refs/heads/a", 0), 0),
        (RefRecord::new("refs/heads/a", 0, RefValue::Id(oid(1))), 1),
        (
            RefRecord::new(
                "refs/tags/v1",
                0,
                RefValue::Tag {
                    id: oid(1),
                    peeled: oid(2),
                },
            ),
            2,
        ),
        (
            RefRecord::new(
                "HEAD",
                0,
                RefValue::Symref("refs/heads/master".to_string()),
            ),
            3,
        ),
    ];
    for (r, kind) in cases.iter() {
        assert_eq!(r.to_kind().unwrap(), *kind, "{}", r);
    }

    let unpeeled = RefRecord::new("refs/tags/v2", 0, RefValue::Unpeeled(oid(3)));
    match unpeeled.to_kind() {
        Err(Error::PeeledRefRequired(_, _)) => (),
        val => panic!("unexpected {:?}", val),
    }
}

#[test]
fn test_ref_record_roundtrip() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_ref_record_roundtrip {}", seed);

    let min = 42;
    let values = [
        RefValue::Deletion,
        RefValue::Id(oid(9)),
        RefValue::Tag {
            id: oid(7),
            peeled: oid(8),
        },
        RefValue::Symref("refs/heads/main".to_string()),
    ];

    for value in values.iter() {
        let update_index = min + (rng.gen::<u64>() % 1000);
        let r = RefRecord::new("refs/heads/master", update_index, value.clone());

        let mut buf = vec![];
        r.encode_value(min, &mut buf).unwrap();
        let kind = r.to_kind().unwrap();

        let (payload, pos) = decode_payload(block::BLOCK_REF, kind, &buf, 0).unwrap();
        assert_eq!(pos, buf.len());
        match payload {
            Payload::Ref { delta, value } => {
                let out = RefRecord::from_parts(r.as_key(), min, delta, value).unwrap();
                assert_eq!(out, r, "seed {}", seed);
            }
            payload => panic!("unexpected {:?}", payload),
        }
    }
}

#[test]
fn test_log_key_ordering() {
    // newer entries for the same name sort first.
    assert!(log_key("master", 3) < log_key("master", 2));
    assert!(log_key("master", 2) < log_key("master", 1));
    // short names sort ahead of longer names sharing the prefix.
    assert!(log_key("a", 1) < log_key("ab", u64::MAX));
    // names ascend.
    assert!(log_key("aa", 1) < log_key("ab", 100));

    let (name, update_index) = split_log_key(&log_key("refs/heads/x", 77)).unwrap();
    assert_eq!(name, "refs/heads/x");
    assert_eq!(update_index, 77);

    assert!(split_log_key(b"no-separator").is_err());
    assert!(split_log_key(b"short\x00\x01\x02").is_err());
}

#[test]
fn test_log_record_roundtrip() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_log_record_roundtrip {}", seed);

    for _i in 0..100 {
        let who = {
            let bytes = rng.gen::<[u8; 32]>();
            let mut uns = Unstructured::new(&bytes);
            Committer::arbitrary(&mut uns).unwrap()
        };
        let l = LogRecord::new(
            "refs/heads/master",
            rng.gen::<u64>(),
            who,
            oid(1),
            oid(2),
            "commit: tip moved",
        );

        let mut buf = vec![];
        l.encode_value(&mut buf);
        let (payload, pos) = decode_payload(block::BLOCK_LOG, 0, &buf, 0).unwrap();
        assert_eq!(pos, buf.len());
        match payload {
            Payload::Log {
                old_id,
                new_id,
                who,
                message,
            } => {
                let out =
                    LogRecord::from_parts(&l.to_key(), old_id, new_id, who, message).unwrap();
                assert_eq!(out, l, "seed {}", seed);
            }
            payload => panic!("unexpected {:?}", payload),
        }
    }
}

#[test]
fn test_log_tombstone() {
    let l = LogRecord::deletion("refs/heads/master", 10);
    assert!(l.is_deletion());

    let who = Committer::new("ferris", "ferris@rust", 1, 0);
    let l = LogRecord::new("refs/heads/master", 10, who, oid(1), oid(2), "update");
    assert!(!l.is_deletion());
}

#[test]
fn test_obj_record_roundtrip() {
    let obj = ObjRecord {
        prefix: vec![0xde, 0xad],
        positions: vec![24, 4096, 8192, 1 << 30],
    };
    let mut buf = vec![];
    obj.encode_value(&mut buf);

    let (payload, pos) = decode_payload(block::BLOCK_OBJ, 0, &buf, 0).unwrap();
    assert_eq!(pos, buf.len());
    match payload {
        Payload::Obj { positions } => assert_eq!(positions, obj.positions),
        payload => panic!("unexpected {:?}", payload),
    }
}

#[test]
fn test_validate_ref_name() {
    assert!(validate_ref_name("refs/heads/master").is_ok());
    assert!(validate_ref_name("HEAD").is_ok());

    for name in ["", "refs/heads/", "refs/\x00bad"].iter() {
        match validate_ref_name(name) {
            Err(Error::ContractError(_, _)) => (),
            val => panic!("{:?} for {:?}", val, name),
        }
    }
}
