use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::{
    record::{Committer, LogRecord, Oid, RefRecord, RefValue},
    BufSource, Error,
};

fn oid(fill: u8) -> Oid {
    let mut bytes = [0; crate::ID_LENGTH];
    bytes[crate::ID_LENGTH - 1] = fill;
    Oid::new(bytes)
}

fn who() -> Committer {
    Committer::new("ferris", "ferris@rust", 1_600_000_000, 0)
}

fn reader(refs: &[RefRecord], logs: &[LogRecord], range: (u64, u64)) -> Reader<BufSource> {
    let mut writer = Writer::in_memory(Config::new());
    writer.begin(range.0, range.1).unwrap();
    writer.sort_and_write_refs(refs).unwrap();
    writer.write_logs(logs).unwrap();
    writer.finish().unwrap();
    Reader::new(BufSource::new(writer.into_bytes().unwrap())).unwrap()
}

#[test]
fn test_compact_empty_input() {
    let compactor = Compactor::new(Config::new());
    assert!(matches!(
        compactor.compact_to_bytes::<BufSource>(vec![]),
        Err(Error::ContractError(_, _))
    ));
}

#[test]
fn test_compact_two_tables_one_ref() {
    let t0 = reader(
        &[RefRecord::new("refs/heads/master", 0, RefValue::Id(oid(1)))],
        &[],
        (0, 0),
    );
    let t1 = reader(
        &[RefRecord::new("refs/heads/master", 1, RefValue::Id(oid(2)))],
        &[],
        (1, 1),
    );

    let compactor = Compactor::new(Config::new());
    let (data, stats) = compactor.compact_to_bytes(vec![t0, t1]).unwrap();
    assert_eq!(stats.n_tables, 2);
    assert_eq!(stats.n_input_refs, 2);
    assert_eq!(stats.stats.n_refs, 1);
    assert_eq!(stats.stats.min_update_index, 0);
    assert_eq!(stats.stats.max_update_index, 1);

    let out = Reader::new(BufSource::new(data)).unwrap();
    assert_eq!(out.to_min_update_index(), 0);
    assert_eq!(out.to_max_update_index(), 1);
    let refs: Vec<RefRecord> = out.all_refs().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "refs/heads/master");
    assert_eq!(refs[0].value, RefValue::Id(oid(2)));
    assert_eq!(refs[0].update_index, 1);
}

#[test]
fn test_compact_tombstone_pruning() {
    let make = || {
        let t0 = reader(
            &[RefRecord::new("refs/heads/master", 0, RefValue::Id(oid(1)))],
            &[],
            (0, 0),
        );
        let t1 = reader(&[RefRecord::deletion("refs/heads/master", 1)], &[], (1, 1));
        vec![t0, t1]
    };

    // pruned by default.
    let compactor = Compactor::new(Config::new());
    let (data, stats) = compactor.compact_to_bytes(make()).unwrap();
    assert_eq!(stats.stats.n_refs, 0);
    assert_eq!(stats.n_dropped_refs, 1);
    let out = Reader::new(BufSource::new(data)).unwrap();
    assert!(out.all_refs().unwrap().next().is_none());

    // preserved on demand.
    let mut compactor = Compactor::new(Config::new());
    compactor.set_include_deletes(true);
    let (data, stats) = compactor.compact_to_bytes(make()).unwrap();
    assert_eq!(stats.stats.n_refs, 1);
    assert_eq!(stats.n_dropped_refs, 0);
    let mut out = Reader::new(BufSource::new(data)).unwrap();
    out.set_include_deletes(true);
    let refs: Vec<RefRecord> = out.all_refs().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(refs.len(), 1);
    assert!(refs[0].is_deletion());
    assert_eq!(refs[0].update_index, 1);
}

#[test]
fn test_compact_log_tombstone() {
    let logs0 = vec![
        LogRecord::new("refs/heads/a", 2, who(), oid(1), oid(2), "newer"),
        LogRecord::new("refs/heads/a", 1, who(), Oid::zero(), oid(1), "init"),
    ];
    let t0 = reader(&[], &logs0, (1, 2));
    // tombstone for the newer entry only.
    let logs1 = vec![LogRecord::deletion("refs/heads/a", 2)];
    let t1 = reader(&[], &logs1, (2, 2));

    let compactor = Compactor::new(Config::new());
    let (data, stats) = compactor.compact_to_bytes(vec![t0, t1]).unwrap();
    assert_eq!(stats.n_input_logs, 3);
    assert_eq!(stats.n_dropped_logs, 1);

    let out = Reader::new(BufSource::new(data)).unwrap();
    let logs: Vec<LogRecord> = out.all_logs().unwrap().map(|l| l.unwrap()).collect();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].update_index, 1);
    assert_eq!(logs[0].message, "init");
}

#[test]
fn test_compact_single_table_idempotent() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_compact_single_table_idempotent {}", seed);

    let mut refs = vec![];
    for i in 0..300 {
        let name = format!("refs/heads/branch-{:03}", i);
        let value = match rng.gen::<usize>() % 3 {
            0 => RefValue::Id(Oid::new(rng.gen::<[u8; 20]>())),
            1 => RefValue::Tag {
                id: Oid::new(rng.gen::<[u8; 20]>()),
                peeled: Oid::new(rng.gen::<[u8; 20]>()),
            },
            _ => RefValue::Symref("refs/heads/branch-000".to_string()),
        };
        refs.push(RefRecord::new(&name, 3 + (rng.gen::<u64>() % 7), value));
    }
    let mut logs = vec![];
    for i in (0..300).step_by(11) {
        let name = format!("refs/heads/branch-{:03}", i);
        logs.push(LogRecord::new(&name, 9, who(), oid(1), oid(2), "tip"));
        logs.push(LogRecord::new(&name, 8, who(), oid(0), oid(1), "older"));
    }
    let t = reader(&refs, &logs, (3, 9));

    let compactor = Compactor::new(Config::new());
    let (data, stats) = compactor.compact_to_bytes(vec![t.clone()]).unwrap();
    assert_eq!(stats.stats.n_refs, 300, "seed {}", seed);
    assert_eq!(stats.stats.n_logs, logs.len() as u64, "seed {}", seed);

    let out = Reader::new(BufSource::new(data)).unwrap();
    assert_eq!(out.to_min_update_index(), 3);
    assert_eq!(out.to_max_update_index(), 9);

    let got: Vec<RefRecord> = out.all_refs().unwrap().map(|r| r.unwrap()).collect();
    let want: Vec<RefRecord> = t.all_refs().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(got, want, "seed {}", seed);

    let got: Vec<LogRecord> = out.all_logs().unwrap().map(|l| l.unwrap()).collect();
    let want: Vec<LogRecord> = t.all_logs().unwrap().map(|l| l.unwrap()).collect();
    assert_eq!(got, want, "seed {}", seed);
}

#[test]
fn test_compact_overlapping_ranges() {
    let t0 = reader(
        &[
            RefRecord::new("refs/heads/a", 2, RefValue::Id(oid(1))),
            RefRecord::new("refs/heads/b", 5, RefValue::Id(oid(2))),
        ],
        &[],
        (0, 5),
    );
    let t1 = reader(
        &[
            RefRecord::new("refs/heads/a", 4, RefValue::Id(oid(3))),
            RefRecord::new("refs/heads/c", 7, RefValue::Id(oid(4))),
        ],
        &[],
        (3, 8),
    );

    let compactor = Compactor::new(Config::new());
    let (data, _stats) = compactor.compact_to_bytes(vec![t0, t1]).unwrap();
    let out = Reader::new(BufSource::new(data)).unwrap();
    assert_eq!(out.to_min_update_index(), 0);
    assert_eq!(out.to_max_update_index(), 8);

    let refs: Vec<RefRecord> = out.all_refs().unwrap().map(|r| r.unwrap()).collect();
    let summary: Vec<(String, u64)> = refs
        .iter()
        .map(|r| (r.name.clone(), r.update_index))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("refs/heads/a".to_string(), 4),
            ("refs/heads/b".to_string(), 5),
            ("refs/heads/c".to_string(), 7),
        ]
    );
}
