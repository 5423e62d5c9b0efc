//! Producer/consumer round trip over a small databuf.
//!
//! A producer thread writes a distinct byte pattern into ten successive
//! blocks of a 4-block ring while a consumer thread drains them. The
//! consumer must observe every pattern once, in order, and the run must
//! not deadlock: the ring's per-block semaphores provide all the
//! backpressure.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use vela_databuf::{BlockState, Databuf, DatabufGeometry};

const N_BLOCK: usize = 4;
const BLOCK_SIZE: usize = 1024;
const N_WRITES: usize = 10;

fn scratch_dir() -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("vela_ring_roundtrip_{ts}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn ten_blocks_through_a_four_block_ring() {
    let dir = scratch_dir();
    let geo = DatabufGeometry {
        n_block: N_BLOCK,
        block_size: BLOCK_SIZE,
        header_size: 800,
    };
    Databuf::create(&dir, 1, geo).unwrap();

    let producer = {
        let dir = dir.clone();
        std::thread::spawn(move || {
            let db = Databuf::attach(&dir, 1).unwrap();
            for i in 0..N_WRITES {
                let blk = i % N_BLOCK;
                db.wait_free(blk);
                // SAFETY: we own blk between wait_free and set_filled.
                unsafe { db.data_slice(blk) }.fill(i as u8);
                db.set_filled(blk);
            }
        })
    };

    let consumer = {
        let dir = dir.clone();
        std::thread::spawn(move || {
            let db = Databuf::attach(&dir, 1).unwrap();
            let mut seen = Vec::with_capacity(N_WRITES);
            for i in 0..N_WRITES {
                let blk = i % N_BLOCK;
                db.wait_filled(blk);
                // SAFETY: we own blk between wait_filled and set_free.
                let data = unsafe { db.data_slice(blk) };
                seen.push(data[0]);
                assert!(data.iter().all(|&b| b == data[0]), "torn block {blk}");
                db.set_free(blk);
            }
            seen
        })
    };

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    let expected: Vec<u8> = (0..N_WRITES as u8).collect();
    assert_eq!(seen, expected, "blocks out of order or lost");

    // Quiescent ring: everything consumed, everything reusable.
    let db = Databuf::attach(&dir, 1).unwrap();
    assert_eq!(db.filled_total(), 0);
    for i in 0..N_BLOCK {
        assert_eq!(db.block_state(i), BlockState::Clear);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn consumer_that_ignores_payloads_keeps_ring_live() {
    // A drain stage may recycle blocks without ever reading data; the
    // handoff must not depend on payload access.
    let dir = scratch_dir();
    let geo = DatabufGeometry {
        n_block: 2,
        block_size: 256,
        header_size: 800,
    };
    Databuf::create(&dir, 1, geo).unwrap();

    let drain = {
        let dir = dir.clone();
        std::thread::spawn(move || {
            let db = Databuf::attach(&dir, 1).unwrap();
            for i in 0..20 {
                let blk = i % 2;
                db.wait_filled(blk);
                db.set_free(blk);
            }
        })
    };

    let db = Databuf::attach(&dir, 1).unwrap();
    for i in 0..20 {
        let blk = i % 2;
        db.wait_free(blk);
        db.set_filled(blk);
    }
    drain.join().unwrap();
    assert_eq!(db.filled_total(), 0);
    let _ = std::fs::remove_dir_all(&dir);
}
