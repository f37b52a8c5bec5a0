use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

/// 30-minute service over a 00:00-23:30 day gives this many slots.
const SLOTS_PER_DAY: usize = 47;

async fn connect_db(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("slotwise")
        .password("slotwise");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Connect to a fresh tenant.
async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    connect_db(host, port, &format!("bench_{}", Ulid::new())).await
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
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

fn first_bookable_day() -> NaiveDate {
    Utc::now().date_naive() + Days::new(7)
}

/// Slot `n` counted across days: (date, "HH:MM").
fn nth_slot(n: usize) -> (NaiveDate, String) {
    let date = first_bookable_day() + Days::new((n / SLOTS_PER_DAY) as u64);
    let minutes = (n % SLOTS_PER_DAY) * 30;
    (date, format!("{:02}:{:02}", minutes / 60, minutes % 60))
}

/// A 30-minute service open all week. Returns the service id.
async fn setup_calendar(client: &tokio_postgres::Client) -> Ulid {
    let svc = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration_minutes, price_cents) VALUES ('{svc}', 'Consultation', 30, 0)"
        ))
        .await
        .unwrap();
    let rows: Vec<String> = (0..7)
        .map(|dow| format!("('{}', {dow}, '00:00', '23:30', false)", Ulid::new()))
        .collect();
    client
        .batch_execute(&format!(
            "INSERT INTO rules (id, day_of_week, start_time, end_time, is_blocked) VALUES {}",
            rows.join(", ")
        ))
        .await
        .unwrap();
    svc
}

async fn book(
    client: &tokio_postgres::Client,
    svc: Ulid,
    date: NaiveDate,
    start: &str,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            "INSERT INTO bookings (id, user_id, service_id, booking_date, start_time) VALUES ($1, $2, $3, $4, $5)",
            &[
                &Ulid::new().to_string(),
                &Ulid::new().to_string(),
                &svc.to_string(),
                &date.to_string(),
                &start,
            ],
        )
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let svc = setup_calendar(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let (date, time) = nth_slot(i);
        let t = Instant::now();
        book(&client, svc, date, &time).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

/// Many clients in one tenant race for the same slots; each slot must admit exactly once.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = format!("bench_race_{}", Ulid::new());
    let setup_client = connect_db(host, port, &tenant).await;
    let svc = setup_calendar(&setup_client).await;

    let n_tasks = 10;
    let n_slots = 200;
    let admitted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let admitted = admitted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            for i in 0..n_slots {
                let (date, time) = nth_slot(i);
                match book(&client, svc, date, &time).await {
                    Ok(_) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let ok = admitted.load(Ordering::Relaxed);
    let lost = rejected.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {ok} admitted, {lost} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    if ok != n_slots {
        println!("  WARNING: expected exactly {n_slots} admissions");
    }
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = format!("bench_read_{}", Ulid::new());
    let setup_client = connect_db(host, port, &tenant).await;
    let svc = setup_calendar(&setup_client).await;
    // Half-fill the first day so availability is non-trivial
    for i in (0..SLOTS_PER_DAY).step_by(2) {
        let (date, time) = nth_slot(i);
        book(&setup_client, svc, date, &time).await.unwrap();
    }
    drop(setup_client);
    let read_date = first_bookable_day();

    // Writers book later days in the same tenant
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            let mut i = SLOTS_PER_DAY * (1 + w * 100);
            while !stop.load(Ordering::Relaxed) {
                let (date, time) = nth_slot(i);
                let _ = book(&client, svc, date, &time).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect_db(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE service_id = '{svc}' AND date = '{read_date}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let svc = setup_calendar(&client).await;
            for i in 0..ops_per_conn {
                let (date, time) = nth_slot(i);
                book(&client, svc, date, &time).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTWISE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTWISE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTWISE_PORT");

    println!("=== slotwise stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended admissions, one tenant");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
