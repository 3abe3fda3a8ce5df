use clap::Parser;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Delay between requests per client, in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Ingress base URL of any cluster node (writes need the leader)
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server: String,
}

/// Wire shape of one mutation, matching what the node's codec decodes:
/// a MessagePack map with string fields.
#[derive(Serialize)]
struct Command {
    op: String,
    key: String,
    value: String,
}

fn set_payload(key: String, value: String) -> Vec<u8> {
    let cmd = Command {
        op: "SET".to_string(),
        key,
        value,
    };
    rmp_serde::to_vec_named(&cmd).expect("msgpack encode")
}

async fn insert(
    client: &hyper::Client<hyper::client::HttpConnector>,
    server: &str,
    payload: Vec<u8>,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let req = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("{}/insert-val", server))
        .header("content-type", "application/msgpack")
        .body(hyper::Body::from(payload))?;
    let resp = client.request(req).await?;
    let body = hyper::body::to_bytes(resp.into_body()).await?;
    Ok(&body[..] == b"ok")
}

async fn verify_get(server: &str, key: &str) {
    let client = hyper::Client::new();
    let url = format!("{}/get-val?key={}", server, key);
    match client.get(url.parse().expect("valid url")).await {
        Ok(resp) => {
            let body = hyper::body::to_bytes(resp.into_body())
                .await
                .unwrap_or_default();
            println!("GET verification for '{}': {}", key, String::from_utf8_lossy(&body));
        }
        Err(e) => eprintln!("verification failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));
    let failed_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, interval {} ms",
        args.concurrency, args.interval
    );

    // Warm up: one write so the verification key exists even at low rates.
    let warmup = hyper::Client::new();
    if !insert(
        &warmup,
        &server_addr,
        set_payload("bench_warmup".to_string(), "ok".to_string()),
    )
    .await
    .unwrap_or(false)
    {
        eprintln!("warmup write failed; is this node the leader?");
    }

    let mut handles = vec![];
    for worker in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let failed_requests = failed_requests.clone();

        let handle = tokio::spawn(async move {
            let client = hyper::Client::new();
            loop {
                let start = Instant::now();
                let key = format!("bench_{}_{}", worker, rand::random::<u64>() % 1000);
                let value = format!("{}", rand::random::<u64>());

                match insert(&client, &server_addr, set_payload(key, value)).await {
                    Ok(true) => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        hist.record(duration.as_micros() as u64).unwrap();
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Ok(false) => {
                        let mut failed = failed_requests.lock().await;
                        *failed += 1;
                    }
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                tokio::time::sleep(Duration::from_millis(args.interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    verify_get(&server_addr, "bench_warmup").await;

    // Print statistics
    let total = *total_requests.lock().await;
    let failed = *failed_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Failed Proposals: {}", failed);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
