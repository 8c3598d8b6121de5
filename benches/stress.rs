//! Booking latency and contention bench against a running allot server.
//!
//! Start the server (`cargo run --release`), then:
//!   ALLOT_HOST=127.0.0.1 ALLOT_PORT=5454 cargo bench

use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("allot")
        .password("allot");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn summarize(label: &str, mut samples: Vec<Duration>) {
    if samples.is_empty() {
        return;
    }
    samples.sort();
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let at = |p: usize| samples[(samples.len() * p / 100).min(samples.len() - 1)];
    let mean = samples.iter().sum::<Duration>() / samples.len() as u32;
    println!(
        "  {label}: n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        samples.len(),
        ms(mean),
        ms(at(50)),
        ms(at(95)),
        ms(at(99)),
        ms(*samples.last().unwrap()),
    );
}

async fn seed_event(client: &tokio_postgres::Client, start: i64, end: i64) -> String {
    let id = Ulid::new().to_string();
    client
        .simple_query(&format!(
            r#"INSERT INTO events (id, title, start, "end") VALUES ('{id}', NULL, {start}, {end})"#
        ))
        .await
        .expect("insert event");
    id
}

/// Sequential bookings on disjoint windows: the happy path.
async fn bench_sequential(host: &str, port: u16, n: usize) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;

    let room = Ulid::new().to_string();
    client
        .simple_query(&format!(
            "INSERT INTO resources (id, name, kind, total_quantity) VALUES ('{room}', 'Bench room', 'exclusive', 1)"
        ))
        .await
        .expect("insert resource");

    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let start = (i as i64) * HOUR;
        let event = seed_event(&client, start, start + HOUR).await;
        let began = Instant::now();
        client
            .simple_query(&format!(
                "INSERT INTO allocations (id, resource_id, event_id, quantity) VALUES ('{}', '{room}', '{event}', 1)",
                Ulid::new()
            ))
            .await
            .expect("insert allocation");
        latencies.push(began.elapsed());
    }
    summarize("sequential bookings", latencies);
}

/// Many tasks fight over one single-unit window; exactly one wins per round.
async fn bench_contention(host: &str, port: u16, tasks: usize, rounds: usize) {
    let setup = connect(host, port, "bench_contention").await;
    let room = Ulid::new().to_string();
    setup
        .simple_query(&format!(
            "INSERT INTO resources (id, name, kind, total_quantity) VALUES ('{room}', 'Contended room', 'exclusive', 1)"
        ))
        .await
        .expect("insert resource");

    let mut wins = 0usize;
    let mut rejections = 0usize;
    let mut latencies = Vec::new();

    for round in 0..rounds {
        let window_start = (round as i64) * HOUR;
        let mut handles = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let host = host.to_string();
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                let client = connect(&host, port, "bench_contention").await;
                let event = seed_event(&client, window_start, window_start + HOUR).await;
                let began = Instant::now();
                let result = client
                    .simple_query(&format!(
                        "INSERT INTO allocations (id, resource_id, event_id, quantity) VALUES ('{}', '{room}', '{event}', 1)",
                        Ulid::new()
                    ))
                    .await;
                (result.is_ok(), began.elapsed())
            }));
        }
        for h in handles {
            let (won, latency) = h.await.expect("task panicked");
            if won {
                wins += 1;
            } else {
                rejections += 1;
            }
            latencies.push(latency);
        }
    }

    println!("  contention: {wins} wins, {rejections} rejections over {rounds} rounds");
    assert_eq!(wins, rounds, "exactly one booking should win each round");
    summarize("contended bookings", latencies);
}

/// Availability queries against a resource with a populated ledger.
async fn bench_availability(host: &str, port: u16, n: usize) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;

    let room = Ulid::new().to_string();
    client
        .simple_query(&format!(
            "INSERT INTO resources (id, name, kind, total_quantity) VALUES ('{room}', 'Query room', 'exclusive', 5)"
        ))
        .await
        .expect("insert resource");
    for i in 0..200 {
        let start = (i as i64) * HOUR;
        let event = seed_event(&client, start, start + HOUR).await;
        client
            .simple_query(&format!(
                "INSERT INTO allocations (id, resource_id, event_id, quantity) VALUES ('{}', '{room}', '{event}', 1)",
                Ulid::new()
            ))
            .await
            .expect("insert allocation");
    }

    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let start = ((i % 200) as i64) * HOUR;
        let began = Instant::now();
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE resource_id = '{room}' AND start >= {start} AND \"end\" <= {}",
                start + HOUR
            ))
            .await
            .expect("availability query");
        latencies.push(began.elapsed());
    }
    summarize("availability queries", latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5454);

    println!("allot stress bench against {host}:{port}");
    bench_sequential(&host, port, 500).await;
    bench_availability(&host, port, 1000).await;
    bench_contention(&host, port, 8, 20).await;
}
