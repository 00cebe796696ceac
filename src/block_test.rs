use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

// ref-flavored test payload: varint update-index delta, kind 1 carries an
// object-id.
fn ref_value(fill: u8) -> Vec<u8> {
    let mut value = vec![0]; // delta 0
    value.extend_from_slice(&[fill; crate::ID_LENGTH]);
    value
}

fn build_keys(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| format!("refs/heads/branch-{:05}", i).into_bytes())
        .collect()
}

fn decode_all(block: &Block) -> Vec<(Vec<u8>, Payload)> {
    let mut out = vec![];
    let (mut pos, mut key) = (BLOCK_HEADER_SIZE, vec![]);
    while let Some((payload, next)) = block.decode_entry(pos, &mut key).unwrap() {
        out.push((key.clone(), payload));
        pos = next;
    }
    out
}

#[test]
fn test_block_roundtrip() {
    let keys = build_keys(100);

    let mut builder = BlockBuilder::new(BLOCK_REF, 8192, RESTART_INTERVAL);
    for (i, key) in keys.iter().enumerate() {
        assert!(builder.append(key, 1, &ref_value(i as u8)).unwrap());
    }
    assert_eq!(builder.len_records(), 100);
    assert_eq!(builder.as_last_key(), keys[99].as_slice());

    let bytes = builder.finish(false).unwrap();
    let block = Block::decode(&bytes).unwrap();
    assert_eq!(block.block_type(), BLOCK_REF);
    assert_eq!(block.disk_len(), bytes.len());
    assert_eq!(block.first_key().unwrap(), keys[0]);
    assert_eq!(block.last_key().unwrap(), keys[99]);

    let entries = decode_all(&block);
    assert_eq!(entries.len(), 100);
    for (i, (key, payload)) in entries.iter().enumerate() {
        assert_eq!(key, &keys[i]);
        match payload {
            Payload::Ref { delta: 0, value } => match value {
                crate::RefValue::Id(id) => assert_eq!(id.as_bytes()[0], i as u8),
                value => panic!("unexpected {:?}", value),
            },
            payload => panic!("unexpected {:?}", payload),
        }
    }
}

#[test]
fn test_block_seek() {
    let keys = build_keys(200);

    let mut builder = BlockBuilder::new(BLOCK_REF, 1 << 20, RESTART_INTERVAL);
    for key in keys.iter() {
        assert!(builder.append(key, 0, &[0]).unwrap());
    }
    let bytes = builder.finish(false).unwrap();
    let block = Block::decode(&bytes).unwrap();

    // exact, in-between and past-the-end targets.
    for (i, key) in keys.iter().enumerate() {
        let (pos, mut state) = block.seek(key).unwrap();
        block.decode_entry(pos, &mut state).unwrap().unwrap();
        assert_eq!(state, keys[i], "seek exact {}", i);
    }

    let (pos, mut state) = block.seek(b"refs/heads/branch-00010a").unwrap();
    block.decode_entry(pos, &mut state).unwrap().unwrap();
    assert_eq!(state, keys[11]);

    let (pos, mut state) = block.seek(b"refs/heads/aaa").unwrap();
    block.decode_entry(pos, &mut state).unwrap().unwrap();
    assert_eq!(state, keys[0]);

    let (pos, mut state) = block.seek(b"refs/zzz").unwrap();
    assert!(block.decode_entry(pos, &mut state).unwrap().is_none());
}

#[test]
fn test_block_overflow() {
    let keys = build_keys(1000);

    let mut builder = BlockBuilder::new(BLOCK_REF, 512, RESTART_INTERVAL);
    let mut n = 0;
    for key in keys.iter() {
        if !builder.append(key, 0, &[0]).unwrap() {
            break;
        }
        n += 1;
    }
    assert!(n > 0 && n < 1000, "{} records in 512 bytes", n);

    let bytes = builder.finish(false).unwrap();
    assert!(bytes.len() <= 512, "{}", bytes.len());
    let block = Block::decode(&bytes).unwrap();
    assert_eq!(decode_all(&block).len(), n);
}

#[test]
fn test_block_size_too_small() {
    let mut builder = BlockBuilder::new(BLOCK_REF, 32, RESTART_INTERVAL);
    let key = b"refs/heads/a-name-longer-than-the-block";
    match builder.append(key, 0, &[0]) {
        Err(Error::BlockSizeTooSmall(_, min)) => {
            // reported minimum is achievable.
            let mut builder = BlockBuilder::new(BLOCK_REF, min, RESTART_INTERVAL);
            assert!(builder.append(key, 0, &[0]).unwrap());
            builder.finish(false).unwrap();
        }
        val => panic!("unexpected {:?}", val),
    }
}

#[test]
fn test_block_unbounded() {
    let keys = build_keys(5000);

    let mut builder = BlockBuilder::new_unbounded(BLOCK_INDEX, RESTART_INTERVAL);
    for key in keys.iter() {
        assert!(builder.append(key, 0, &[7]).unwrap());
    }
    let bytes = builder.finish(false).unwrap();
    let block = Block::decode(&bytes).unwrap();
    assert_eq!(decode_all(&block).len(), 5000);
}

#[test]
fn test_log_block_compression() {
    let mut builder = BlockBuilder::new(BLOCK_LOG, 1 << 20, RESTART_INTERVAL);
    let mut keys = vec![];
    for i in 0..50 {
        let mut key = format!("refs/heads/master-{:03}", i).into_bytes();
        key.push(0);
        key.extend_from_slice(&(!(i as u64)).to_be_bytes());
        keys.push(key);
    }
    let value = {
        let l = crate::LogRecord::new(
            "x",
            0,
            crate::Committer::new("ferris", "ferris@rust", 1_600_000_000, 330),
            crate::Oid::zero(),
            crate::Oid::zero(),
            "reflog message, compresses well well well",
        );
        let mut buf = vec![];
        l.encode_value(&mut buf);
        buf
    };
    let uncompressed: usize = keys.iter().map(|k| k.len() + value.len()).sum();
    for key in keys.iter() {
        assert!(builder.append(key, 0, &value).unwrap());
    }

    let bytes = builder.finish(true).unwrap();
    assert!(bytes.len() < uncompressed, "{} {}", bytes.len(), uncompressed);

    let block = Block::decode(&bytes).unwrap();
    assert_eq!(block.block_type(), BLOCK_LOG);
    let entries = decode_all(&block);
    assert_eq!(entries.len(), 50);
    assert_eq!(entries[0].0, keys[0]);
    assert_eq!(entries[49].0, keys[49]);
}

#[test]
fn test_log_block_uncompressed() {
    let mut builder = BlockBuilder::new(BLOCK_LOG, 1 << 20, RESTART_INTERVAL);
    let value = {
        let l = crate::LogRecord::new(
            "x",
            0,
            crate::Committer::new("ferris", "ferris@rust", 1, 0),
            crate::Oid::zero(),
            crate::Oid::zero(),
            "stored raw",
        );
        let mut buf = vec![];
        l.encode_value(&mut buf);
        buf
    };
    let mut key = b"refs/heads/master".to_vec();
    key.push(0);
    key.extend_from_slice(&(!7_u64).to_be_bytes());
    builder.append(&key, 0, &value).unwrap();

    let bytes = builder.finish(false).unwrap();
    let block = Block::decode(&bytes).unwrap();
    let entries = decode_all(&block);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, key);
}

#[test]
fn test_block_crc() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_block_crc {}", seed);

    let mut builder = BlockBuilder::new(BLOCK_REF, 4096, RESTART_INTERVAL);
    for key in build_keys(20).iter() {
        builder.append(key, 0, &[0]).unwrap();
    }
    let bytes = builder.finish(false).unwrap();
    Block::decode(&bytes).unwrap();

    for _i in 0..100 {
        let mut corrupt = bytes.clone();
        // leave the header alone, its fields fail before the crc check.
        let off = 4 + (rng.gen::<usize>() % (corrupt.len() - 4));
        corrupt[off] ^= 1 << (rng.gen::<u8>() % 8);
        match Block::decode(&corrupt) {
            Err(Error::IntegrityError(_, _)) => (),
            Ok(_) => panic!("corruption at {} undetected, seed {}", off, seed),
            Err(err) => panic!("unexpected {} seed {}", err, seed),
        }
    }

    // header corruption: type tag and truncated size.
    let mut corrupt = bytes.clone();
    corrupt[0] = b'x';
    assert!(matches!(
        Block::decode(&corrupt),
        Err(Error::FormatError(_, _))
    ));

    assert!(matches!(
        Block::decode(&bytes[..bytes.len() - 1]),
        Err(Error::FormatError(_, _))
    ));
}
