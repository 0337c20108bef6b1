use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{FixedOffset, NaiveDate};
use ulid::Ulid;

use blockcal::engine::{Calendar, Granularity};
use blockcal::model::{BlockKind, Candidate, Recurrence, RecurrencePattern};
use blockcal::store::LocalStore;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn owner(start: i64, end: i64) -> Candidate {
    Candidate::new(start, end, BlockKind::OwnerBlock)
}

fn calendar() -> Arc<Calendar> {
    let dir = std::env::temp_dir().join(format!("blockcal_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let store = LocalStore::open(dir.join("blocks.wal")).expect("open store");
    Arc::new(Calendar::new(Arc::new(store), FixedOffset::east_opt(0).expect("utc")))
}

async fn phase1_sequential(cal: &Calendar) {
    let rid = Ulid::new();
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        // Two-hour gaps: every proposal is a plain insert.
        let s = BASE + (i as i64) * 3 * HOUR;
        let t = Instant::now();
        cal.propose(rid, owner(s, s + HOUR)).await.expect("propose");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} inserts in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("propose latency", &mut latencies);
}

async fn phase2_concurrent(cal: Arc<Calendar>) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();

    let handles: Vec<_> = (0..n_tasks)
        .map(|_| {
            let cal = cal.clone();
            tokio::spawn(async move {
                let rid = Ulid::new();
                for j in 0..n_per_task {
                    let s = BASE + (j as i64) * 3 * HOUR;
                    cal.propose(rid, owner(s, s + HOUR)).await.expect("propose");
                }
            })
        })
        .collect();
    for h in handles {
        h.await.expect("task");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} resources x {n_per_task} proposals = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_merge_chain(cal: &Calendar) {
    let rid = Ulid::new();
    let n = 500;
    let start = Instant::now();

    // Disjoint blocks, then a bridge over each gap: every bridge merges.
    for i in 0..n {
        let s = BASE + (i as i64) * 2 * HOUR;
        cal.propose(rid, owner(s, s + HOUR)).await.expect("seed");
    }
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n - 1 {
        let s = BASE + (i as i64) * 2 * HOUR + HOUR / 2;
        let t = Instant::now();
        cal.propose(rid, owner(s, s + HOUR)).await.expect("bridge");
        latencies.push(t.elapsed());
    }

    let remaining = cal.intervals(rid).await.expect("intervals").len();
    println!(
        "  {n} blocks bridged into {remaining} in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("merge latency", &mut latencies);
}

async fn phase4_query_under_load(cal: Arc<Calendar>) {
    let rid = Ulid::new();
    for i in 0..200 {
        let s = BASE + (i as i64) * 5 * HOUR;
        cal.propose(rid, owner(s, s + 2 * HOUR)).await.expect("seed");
    }
    let until = NaiveDate::from_ymd_opt(2024, 12, 31).expect("date");
    for pattern in [RecurrencePattern::Weekdays, RecurrencePattern::Weekends] {
        let template = owner(BASE + 20 * HOUR, BASE + 22 * HOUR).with_recurrence(Recurrence { pattern, until });
        cal.propose(rid, template).await.expect("template");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..5)
        .map(|w| {
            let cal = cal.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let wrid = Ulid::new();
                let mut i = 0i64;
                while !stop.load(Ordering::Relaxed) {
                    let s = BASE + (w * 100_000 + i) * 3 * HOUR;
                    let _ = cal.propose(wrid, owner(s, s + HOUR)).await;
                    i += 1;
                }
            })
        })
        .collect();

    let n_readers = 10;
    let reads_per_reader = 500;
    let readers: Vec<_> = (0..n_readers)
        .map(|_| {
            let cal = cal.clone();
            tokio::spawn(async move {
                let mut latencies = Vec::with_capacity(reads_per_reader);
                for r in 0..reads_per_reader {
                    let day = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date") + chrono::Days::new((r % 60) as u64);
                    let t = Instant::now();
                    cal.query(rid, day, Granularity::Month).await.expect("query");
                    latencies.push(t.elapsed());
                }
                latencies
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("reader"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("month view query", &mut all);
}

#[tokio::main]
async fn main() {
    println!("=== blockcal stress benchmark ===\n");

    println!("[phase 1] sequential proposals");
    phase1_sequential(&calendar()).await;

    println!("\n[phase 2] concurrent proposals across resources");
    phase2_concurrent(calendar()).await;

    println!("\n[phase 3] merge chain");
    phase3_merge_chain(&calendar()).await;

    println!("\n[phase 4] view queries under write load");
    phase4_query_under_load(calendar()).await;

    println!("\n=== benchmark complete ===");
}
