use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_varint() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_varint {}", seed);

    for val in [0, 1, 127, 128, 300, 16_383, 16_384, u64::MAX].iter() {
        let mut buf = vec![];
        let n = encode_varint(*val, &mut buf);
        assert_eq!(n, buf.len());
        assert_eq!(n, varint_length(*val));
        let (out, pos) = decode_varint(&buf, 0).unwrap();
        assert_eq!(out, *val);
        assert_eq!(pos, buf.len());
    }

    for _i in 0..1000 {
        let val: u64 = rng.gen();
        let mut buf = vec![0xff; 3]; // leading noise
        encode_varint(val, &mut buf);
        let (out, _) = decode_varint(&buf, 3).unwrap();
        assert_eq!(out, val, "seed {}", seed);
    }

    // truncated input.
    assert!(decode_varint(&[0x80, 0x80], 0).is_err());
    assert!(decode_varint(&[], 0).is_err());
}

#[test]
fn test_u24() {
    for val in [0, 1, 255, 256, 0x00ff_ffff].iter() {
        let mut buf = vec![];
        encode_u24(*val, &mut buf).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(decode_u24(&buf).unwrap(), *val);
    }
    let mut buf = vec![];
    assert!(encode_u24(0x0100_0000, &mut buf).is_err());
    assert!(decode_u24(&[1, 2]).is_err());
}

#[test]
fn test_common_prefix() {
    assert_eq!(common_prefix(b"", b""), 0);
    assert_eq!(common_prefix(b"abc", b""), 0);
    assert_eq!(common_prefix(b"abc", b"abc"), 3);
    assert_eq!(common_prefix(b"abcd", b"abce"), 3);
    assert_eq!(common_prefix(b"abc", b"abcdef"), 3);
    assert_eq!(common_prefix(b"xbc", b"abc"), 0);
}

#[test]
fn test_prefix_successor() {
    assert_eq!(prefix_successor(b"refs/heads/"), Some(b"refs/heads0".to_vec()));
    assert_eq!(prefix_successor(b"a"), Some(b"b".to_vec()));
    assert_eq!(prefix_successor(b"a\xff"), Some(b"b".to_vec()));
    assert_eq!(prefix_successor(b"\xff\xff"), None);
    assert_eq!(prefix_successor(b""), None);

    // successor is strictly greater than any key with the prefix.
    let succ = prefix_successor(b"ab").unwrap();
    assert!(succ.as_slice() > b"ab".as_ref());
    assert!(succ.as_slice() > b"ab\xff\xff\xff".as_ref());
}

#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 4096).unwrap(), 0);
    assert_eq!(align_up(1, 4096).unwrap(), 4096);
    assert_eq!(align_up(4096, 4096).unwrap(), 4096);
    assert_eq!(align_up(4097, 4096).unwrap(), 8192);
    assert_eq!(align_up(100, 0).unwrap(), 100);
}
