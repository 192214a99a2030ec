//! Usage ledger persistence across handles and threads.

use std::sync::Arc;

use envoy_ledger::{TokenUsage, UsageLedger, UsageRecord};

use crate::common::temp_ledger;

fn record(game: &str, agent: &str, model: &str, input: u64, output: u64) -> UsageRecord {
    UsageRecord::new(game, agent, "S1901M", model, TokenUsage::new(input, output))
}

#[test]
fn reopened_ledger_keeps_rows() {
    let (dir, ledger) = temp_ledger();
    ledger.append(&record("g1", "FRANCE", "gpt-4o", 100, 20));

    let reopened = UsageLedger::open(dir.path().join("usage.db")).unwrap();
    let totals = reopened.total_stats("g1");
    assert_eq!(totals.calls, 1);
    assert_eq!(totals.input_tokens, 100);
    assert_eq!(totals.output_tokens, 20);
}

#[test]
fn concurrent_appends_are_all_recorded() {
    let (_dir, ledger) = temp_ledger();
    let ledger = Arc::new(ledger);

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for _ in 0..5 {
                    ledger.append(&record("g-busy", &format!("agent-{i}"), "gpt-4o", 1, 1));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(ledger.total_stats("g-busy").calls, 40);
    assert_eq!(ledger.stats_by_agent("g-busy").len(), 8);
}

#[test]
fn unknown_game_reads_as_empty() {
    let (_dir, ledger) = temp_ledger();
    ledger.append(&record("g1", "FRANCE", "gpt-4o", 1, 1));
    assert!(ledger.stats_by_agent("nope").is_empty());
    assert_eq!(ledger.total_stats("nope").calls, 0);
    assert!(ledger.records("nope").is_empty());
}

#[test]
fn unopenable_path_is_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the database file should be.
    let ledger = UsageLedger::new(dir.path());
    ledger.append(&record("g1", "FRANCE", "gpt-4o", 1, 1));
    assert!(ledger.stats_by_agent("g1").is_empty());
    assert_eq!(ledger.total_stats("g1").calls, 0);
    assert!(ledger.try_total_stats("g1").is_err());
}

#[test]
fn readers_proceed_while_writer_appends() {
    let (_dir, ledger) = temp_ledger();
    let ledger = Arc::new(ledger);
    let writes = 50;

    let writer = {
        let ledger = Arc::clone(&ledger);
        std::thread::spawn(move || {
            for _ in 0..writes {
                ledger.try_append(&record("g-live", "FRANCE", "gpt-4o", 3, 1)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..writes {
                    let totals = ledger.try_total_stats("g-live").unwrap();
                    assert!(totals.calls >= last);
                    assert_eq!(totals.input_tokens, totals.calls * 3);
                    last = totals.calls;
                    ledger.try_stats_by_agent("g-live").unwrap();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let totals = ledger.try_total_stats("g-live").unwrap();
    assert_eq!(totals.calls, writes);
    assert_eq!(totals.input_tokens, writes * 3);
    assert_eq!(totals.output_tokens, writes);
    assert_eq!(ledger.try_stats_by_agent("g-live").unwrap()["FRANCE"].calls, writes);
}
