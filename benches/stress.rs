use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use lodgebook::engine::Engine;
use lodgebook::model::*;
use lodgebook::notify::NotifyHub;

const HOUR: Ms = 3_600_000;

fn open_engine(label: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("lodgebook_bench");
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let path = dir.join(format!("{label}_{}.wal", Ulid::new()));
    Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).expect("open engine"))
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn request(resource_id: Ulid, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        resource_id,
        start,
        end,
        requester_id: Ulid::new(),
        amount: None,
        label: None,
    }
}

async fn phase1_sequential_approvals() {
    let engine = open_engine("sequential");
    let hall = Ulid::new();
    engine
        .create_resource(hall, None, ResourceKind::Exclusive)
        .await
        .unwrap();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = i as Ms * HOUR;
        let t = Instant::now();
        let b = engine.create_booking(request(hall, s, s + HOUR)).await.unwrap();
        engine.approve(b.id).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    print_latency("create+approve", &mut latencies);
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
}

async fn phase2_contended_loans() {
    let engine = open_engine("contended");
    let items: Vec<Ulid> = (0..5).map(|_| Ulid::new()).collect();
    for &id in &items {
        engine
            .create_resource(id, None, ResourceKind::Pooled { total_stock: 50 })
            .await
            .unwrap();
    }

    let n_tasks = 32;
    let per_task = 100;
    let approved = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let engine = engine.clone();
        let items = items.clone();
        let approved = approved.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let s = ((t * per_task + i) % 48) as Ms * HOUR;
                let lines = vec![
                    LoanLine { item_id: items[i % items.len()], quantity: 2 },
                    LoanLine { item_id: items[(i + 1) % items.len()], quantity: 1 },
                ];
                let b = engine
                    .create_pooled_booking(PooledBookingRequest {
                        id: Ulid::new(),
                        lines,
                        start: s,
                        end: s + 4 * HOUR,
                        requester_id: Ulid::new(),
                        amount: None,
                        label: None,
                    })
                    .await
                    .unwrap();
                match engine.approve(b.id).await {
                    Ok(_) => approved.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let total = n_tasks * per_task;
    println!(
        "  {total} loan approvals from {n_tasks} tasks in {:.2}s: {} approved, {} conflicts",
        elapsed.as_secs_f64(),
        approved.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
    );
}

async fn phase3_counter_issuance() {
    let engine = open_engine("counters");
    let n_tasks = 16;
    let per_task = 250;
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(per_task);
            for _ in 0..per_task {
                let t = Instant::now();
                engine.counter_next("receipt").await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }
    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    print_latency("counter_next", &mut latencies);
    println!(
        "  {} numbers in {:.2}s, last = {:?}",
        n_tasks * per_task,
        elapsed.as_secs_f64(),
        engine.counter_current("receipt").await
    );
}

async fn phase4_rotation() {
    let engine = open_engine("rotation");
    for i in 0..200 {
        let participant = Ulid::new();
        engine
            .register_participant(participant, format!("member {i:03}"))
            .await
            .unwrap();
        engine.add_roster_entry(Ulid::new(), participant).await.unwrap();
    }

    let n = 5000;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        engine.advance().await.unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("advance (200 entries)", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== lodgebook stress benchmark ===\n");

    println!("[phase 1] sequential create + approve");
    phase1_sequential_approvals().await;

    println!("\n[phase 2] contended pooled approvals");
    phase2_contended_loans().await;

    println!("\n[phase 3] concurrent counter issuance");
    phase3_counter_issuance().await;

    println!("\n[phase 4] rotation advance");
    phase4_rotation().await;

    println!("\n=== benchmark complete ===");
}
