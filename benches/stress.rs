//! Load test against a running server started with `PADDOCK_ADMIN_EMAIL` set.
//! Every phase works in fresh tenants so results do not interfere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2030-01-01, comfortably in the future for every booking made here.
const BASE: i64 = 1_893_456_000_000;

struct Target {
    host: String,
    port: u16,
    password: String,
    admin: String,
}

impl Target {
    async fn connect(&self, tenant: &str, email: &str) -> Client {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(tenant)
            .user(email)
            .password(&self.password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }

    /// Admin session on a brand new tenant.
    async fn fresh_tenant(&self) -> (String, Client) {
        let tenant = format!("bench_{}", Ulid::new());
        let client = self.connect(&tenant, &self.admin).await;
        (tenant, client)
    }
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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

async fn first_outcome(client: &Client, sql: &str) -> String {
    let messages = client.simple_query(sql).await.unwrap_or_else(|e| panic!("{sql}: {e}"));
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => r.get("outcome").map(String::from),
            _ => None,
        })
        .unwrap_or_default()
}

async fn create_resource(client: &Client, name: &str) -> Ulid {
    let rid = Ulid::new();
    first_outcome(client, &format!("INSERT INTO resources (id, name) VALUES ('{rid}', '{name}')")).await;
    rid
}

async fn create_user(client: &Client, email: &str) -> Ulid {
    let uid = Ulid::new();
    first_outcome(
        client,
        &format!("INSERT INTO users (id, email, name) VALUES ('{uid}', '{email}', 'Bench rider')"),
    )
    .await;
    uid
}

fn booking(rid: Ulid, slot: i64, ack: bool) -> String {
    let bid = Ulid::new();
    let s = BASE + slot * HOUR;
    let e = s + HOUR;
    format!(
        r#"INSERT INTO reservations (id, resource_id, start, "end", purpose, acknowledge_overlap) VALUES ('{bid}', '{rid}', {s}, {e}, 'TRAINING', {ack})"#
    )
}

async fn phase1_sequential(target: &Target) {
    let (_, client) = target.fresh_tenant().await;
    let rid = create_resource(&client, "Sequential arena").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&booking(rid, i as i64, false)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(target: Arc<Target>) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let (_, client) = target.fresh_tenant().await;
            let rid = create_resource(&client, "Concurrent arena").await;
            for j in 0..n_per_task {
                client.batch_execute(&booking(rid, j, false)).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Several riders contend for the same slots on one shared resource. Every request
/// either commits or comes back as an overlap question.
async fn phase3_contention(target: Arc<Target>) {
    let (tenant, admin) = target.fresh_tenant().await;
    let rid = create_resource(&admin, "Contended arena").await;
    let n_riders = 8;
    let slots = 100;

    let mut emails = Vec::new();
    for i in 0..n_riders {
        let email = format!("rider{i}@bench.test");
        create_user(&admin, &email).await;
        emails.push(email);
    }

    let committed = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for email in emails {
        let target = target.clone();
        let tenant = tenant.clone();
        let committed = committed.clone();
        let overlaps = overlaps.clone();
        handles.push(tokio::spawn(async move {
            let client = target.connect(&tenant, &email).await;
            for slot in 0..slots {
                match first_outcome(&client, &booking(rid, slot, false)).await.as_str() {
                    "CREATED" => committed.fetch_add(1, Ordering::Relaxed),
                    _ => overlaps.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    println!(
        "  {n_riders} riders x {slots} slots in {:.2}s: {} committed, {} overlap answers",
        start.elapsed().as_secs_f64(),
        committed.load(Ordering::Relaxed),
        overlaps.load(Ordering::Relaxed),
    );
}

async fn phase4_read_under_load(target: Arc<Target>) {
    let (tenant, admin) = target.fresh_tenant().await;
    let rid = create_resource(&admin, "Busy arena").await;
    for i in 0..200 {
        admin.batch_execute(&booking(rid, i, false)).await.unwrap();
    }

    // Writers keep booking further out on the same resource.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5i64 {
        let target = target.clone();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.connect(&tenant, &target.admin).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&booking(rid, 1_000 + w * 10_000 + i, true)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let target = target.clone();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.connect(&tenant, &target.admin).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            let end = BASE + 24 * 30 * HOUR;
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM reservations WHERE resource_id = '{rid}' AND start >= {BASE} AND "end" <= {end}"#
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

    print_latency("calendar query", &mut all_latencies);
}

/// One block over many live bookings: the whole cascade commits as a single record.
async fn phase5_block_cascade(target: &Target) {
    let (_, admin) = target.fresh_tenant().await;
    let rid = create_resource(&admin, "Cascade arena").await;
    let n = 160;
    for i in 0..n {
        admin.batch_execute(&booking(rid, i, false)).await.unwrap();
    }

    let block = Ulid::new();
    let end = BASE + n * HOUR;
    let t = Instant::now();
    first_outcome(
        &admin,
        &format!(
            r#"INSERT INTO blocks (id, resource_id, reason, start, "end", confirm_conflicts) VALUES ('{block}', '{rid}', 'Resurfacing', {BASE}, {end}, true)"#
        ),
    )
    .await;
    let impact = t.elapsed();

    let t = Instant::now();
    first_outcome(&admin, &format!("DELETE FROM blocks WHERE id = '{block}'")).await;
    let restore = t.elapsed();

    println!(
        "  block over {n} reservations: impact {:.2}ms, restore {:.2}ms",
        impact.as_secs_f64() * 1000.0,
        restore.as_secs_f64() * 1000.0
    );
}

async fn phase6_connection_storm(target: Arc<Target>) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let (_, client) = target.fresh_tenant().await;
            let rid = create_resource(&client, "Storm arena").await;
            for i in 0..ops_per_conn {
                client.batch_execute(&booking(rid, i, false)).await.unwrap();
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
    let target = Arc::new(Target {
        host: std::env::var("PADDOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("PADDOCK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid PADDOCK_PORT"),
        password: std::env::var("PADDOCK_PASSWORD").unwrap_or_else(|_| "paddock".into()),
        admin: std::env::var("PADDOCK_ADMIN_EMAIL").unwrap_or_else(|_| "admin@paddock.local".into()),
    });

    println!("=== paddock stress benchmark ===");
    println!("target: {}:{} as {}\n", target.host, target.port, target.admin);

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(target.clone()).await;

    println!("\n[phase 3] contended slots");
    phase3_contention(target.clone()).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(target.clone()).await;

    println!("\n[phase 5] block cascade");
    phase5_block_cascade(&target).await;

    println!("\n[phase 6] connection storm");
    phase6_connection_storm(target).await;

    println!("\n=== benchmark complete ===");
}
